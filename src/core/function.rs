//! User-defined SQL functions
//!
//! Scalar functions are plain closures over a materialized argument list.
//! Aggregates implement [`Aggregate`]: each GROUP BY group gets its own
//! state, created by [`Aggregate::initial_state`], fed by one
//! [`Aggregate::step`] per row and consumed by exactly one
//! [`Aggregate::finalize`].
//!
//! Arguments are deep-copied out of the engine before a callback runs, so a
//! callback may keep them. Errors and panics raised by a callback are
//! reported to the running query as SQL errors.

use super::connection::Connection;
use super::engine::{Bindings, Engine};
use super::error::{Error, Result};
use super::value::{self, Value};
use ahash::RandomState;
use libsqlite3_sys as ffi;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::raw::{c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// Longest function name the engine accepts, in bytes
pub const MAX_FUNCTION_NAME: usize = 255;

/// Largest fixed argument count the engine accepts
const MAX_FIXED_ARITY: u8 = 127;

/// Number of arguments a function accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Fixed(u8),
    Variadic,
}

impl Arity {
    fn raw(self) -> Result<c_int> {
        match self {
            Arity::Fixed(n) if n > MAX_FIXED_ARITY => Err(Error::InvalidArgument(format!(
                "function arity {} exceeds {}",
                n, MAX_FIXED_ARITY
            ))),
            Arity::Fixed(n) => Ok(n as c_int),
            Arity::Variadic => Ok(-1),
        }
    }
}

/// An aggregate SQL function
pub trait Aggregate: Send + Sync + 'static {
    /// Per-group accumulator
    type State: Send + 'static;

    /// Fresh accumulator for a new group
    fn initial_state(&self) -> Self::State;

    /// Fold one row into the accumulator
    fn step(&self, state: &mut Self::State, args: &[Value]) -> anyhow::Result<()>;

    /// Consume the accumulator and produce the group's result
    fn finalize(&self, state: Self::State) -> anyhow::Result<Value>;
}

/// Closure-based [`Aggregate`]
///
/// ```no_run
/// use sqlbridge_rs::{AggregateFn, Arity, Database, Value};
///
/// # fn main() -> sqlbridge_rs::Result<()> {
/// let db = Database::open_in_memory()?;
/// let product = AggregateFn::new(
///     || 1i64,
///     |acc: &mut i64, args: &[Value]| {
///         *acc *= args[0].get::<i64>()?;
///         Ok(())
///     },
///     |acc| Ok(Value::Integer(acc)),
/// );
/// db.create_aggregate_function("product", Arity::Fixed(1), true, product)?;
/// # Ok(())
/// # }
/// ```
pub struct AggregateFn<I, S, F> {
    init: I,
    step: S,
    finalize: F,
}

impl<T, I, S, F> AggregateFn<I, S, F>
where
    I: Fn() -> T,
    S: Fn(&mut T, &[Value]) -> anyhow::Result<()>,
    F: Fn(T) -> anyhow::Result<Value>,
{
    pub fn new(init: I, step: S, finalize: F) -> Self {
        Self {
            init,
            step,
            finalize,
        }
    }
}

impl<T, I, S, F> Aggregate for AggregateFn<I, S, F>
where
    T: Send + 'static,
    I: Fn() -> T + Send + Sync + 'static,
    S: Fn(&mut T, &[Value]) -> anyhow::Result<()> + Send + Sync + 'static,
    F: Fn(T) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    type State = T;

    fn initial_state(&self) -> T {
        (self.init)()
    }

    fn step(&self, state: &mut T, args: &[Value]) -> anyhow::Result<()> {
        (self.step)(state, args)
    }

    fn finalize(&self, state: T) -> anyhow::Result<Value> {
        (self.finalize)(state)
    }
}

struct ScalarSlot<F> {
    engine: &'static Engine,
    name: String,
    func: F,
}

struct AggregateSlot<A: Aggregate> {
    engine: &'static Engine,
    name: String,
    aggregate: A,
    // keyed by the engine's aggregate context address
    states: Mutex<HashMap<usize, A::State, RandomState>>,
}

fn validate_name(name: &str) -> Result<CString> {
    if name.is_empty() {
        return Err(Error::InvalidArgument("function name must not be empty".into()));
    }
    if name.len() > MAX_FUNCTION_NAME {
        return Err(Error::InvalidArgument(format!(
            "function name is {} bytes, the limit is {}",
            name.len(),
            MAX_FUNCTION_NAME
        )));
    }
    Ok(CString::new(name)?)
}

fn text_rep(deterministic: bool) -> c_int {
    if deterministic {
        ffi::SQLITE_UTF8 | ffi::SQLITE_DETERMINISTIC
    } else {
        ffi::SQLITE_UTF8
    }
}

pub(crate) fn create_scalar<F>(
    conn: &Connection,
    name: &str,
    arity: Arity,
    deterministic: bool,
    func: F,
) -> Result<()>
where
    F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    let c_name = validate_name(name)?;
    let n_arg = arity.raw()?;
    let slot = Box::new(ScalarSlot {
        engine: conn.engine(),
        name: name.to_string(),
        func,
    });

    conn.with_db(move |bindings, db| unsafe {
        // the engine destroys the slot itself when registration fails
        let slot = Box::into_raw(slot);
        let rc = bindings.create_function(
            db,
            &c_name,
            n_arg,
            text_rep(deterministic),
            slot as *mut c_void,
            Some(call_scalar::<F>),
            None,
            None,
            Some(destroy::<ScalarSlot<F>>),
        );
        conn.check(db, rc, "create function")
    })?;
    debug!("Registered scalar function {} ({:?})", name, arity);
    Ok(())
}

pub(crate) fn create_aggregate<A: Aggregate>(
    conn: &Connection,
    name: &str,
    arity: Arity,
    deterministic: bool,
    aggregate: A,
) -> Result<()> {
    let c_name = validate_name(name)?;
    let n_arg = arity.raw()?;
    let slot = Box::new(AggregateSlot {
        engine: conn.engine(),
        name: name.to_string(),
        aggregate,
        states: Mutex::new(HashMap::default()),
    });

    conn.with_db(move |bindings, db| unsafe {
        let slot = Box::into_raw(slot);
        let rc = bindings.create_function(
            db,
            &c_name,
            n_arg,
            text_rep(deterministic),
            slot as *mut c_void,
            None,
            Some(call_step::<A>),
            Some(call_final::<A>),
            Some(destroy::<AggregateSlot<A>>),
        );
        conn.check(db, rc, "create function")
    })?;
    debug!("Registered aggregate function {} ({:?})", name, arity);
    Ok(())
}

// Engine trampolines

/// User data of the running function; read before the engine is known
unsafe fn slot<'a, T>(ctx: *mut ffi::sqlite3_context) -> &'a T {
    &*(ffi::sqlite3_user_data(ctx) as *const T)
}

unsafe fn arguments(
    bindings: &dyn Bindings,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) -> Vec<Value> {
    if argc <= 0 || argv.is_null() {
        return Vec::new();
    }
    std::slice::from_raw_parts(argv, argc as usize)
        .iter()
        .map(|&arg| value::from_raw(bindings, arg))
        .collect()
}

unsafe fn report(
    bindings: &dyn Bindings,
    ctx: *mut ffi::sqlite3_context,
    name: &str,
    outcome: std::thread::Result<anyhow::Result<Value>>,
) {
    match outcome {
        Ok(Ok(value)) => value::set_result(bindings, ctx, &value),
        Ok(Err(e)) => bindings.result_error(ctx, &format!("{}: {:#}", name, e)),
        Err(_) => {
            warn!("User function {} panicked", name);
            bindings.result_error(ctx, &format!("{}: function panicked", name));
        }
    }
}

unsafe extern "C" fn call_scalar<F>(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) where
    F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    let slot = slot::<ScalarSlot<F>>(ctx);
    let bindings = slot.engine.bindings();
    let args = arguments(bindings, argc, argv);
    let outcome = catch_unwind(AssertUnwindSafe(|| (slot.func)(&args)));
    report(bindings, ctx, &slot.name, outcome);
}

unsafe extern "C" fn call_step<A: Aggregate>(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let slot = slot::<AggregateSlot<A>>(ctx);
    let bindings = slot.engine.bindings();
    let key = bindings.aggregate_context(ctx, 1) as usize;
    if key == 0 {
        bindings.result_error_nomem(ctx);
        return;
    }
    let args = arguments(bindings, argc, argv);

    // The state is taken out for the call so the user step runs unlocked
    let taken = slot.states.lock().remove(&key);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut state = taken.unwrap_or_else(|| slot.aggregate.initial_state());
        let result = slot.aggregate.step(&mut state, &args);
        (state, result)
    }));

    match outcome {
        Ok((state, Ok(()))) => {
            slot.states.lock().insert(key, state);
        }
        Ok((state, Err(e))) => {
            slot.states.lock().insert(key, state);
            bindings.result_error(ctx, &format!("{}: {:#}", slot.name, e));
        }
        Err(_) => {
            // state is lost; finalize starts from a fresh one
            warn!("Aggregate {} panicked in step", slot.name);
            bindings.result_error(ctx, &format!("{}: function panicked", slot.name));
        }
    }
}

unsafe extern "C" fn call_final<A: Aggregate>(ctx: *mut ffi::sqlite3_context) {
    let slot = slot::<AggregateSlot<A>>(ctx);
    let bindings = slot.engine.bindings();
    let key = bindings.aggregate_context(ctx, 0) as usize;

    // null context: the aggregate ran over zero rows
    let taken = if key == 0 {
        None
    } else {
        slot.states.lock().remove(&key)
    };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let state = taken.unwrap_or_else(|| slot.aggregate.initial_state());
        slot.aggregate.finalize(state)
    }));
    report(bindings, ctx, &slot.name, outcome);
}

unsafe extern "C" fn destroy<T>(p: *mut c_void) {
    if !p.is_null() {
        drop(Box::from_raw(p as *mut T));
    }
}
