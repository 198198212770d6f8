#![no_main]
use libfuzzer_sys::fuzz_target;
use sqlbridge_rs::core::vfs::LockTable;
use sqlbridge_rs::LockLevel;

const LEVELS: [LockLevel; 5] = [
    LockLevel::None,
    LockLevel::Shared,
    LockLevel::Reserved,
    LockLevel::Pending,
    LockLevel::Exclusive,
];

// Random acquire/release sequences from four handles must never grant two
// writers or a writer alongside readers
fuzz_target!(|input: &[u8]| {
    let mut table = LockTable::new();
    let mut held = [LockLevel::None; 4];

    for pair in input.chunks_exact(2).take(256) {
        let handle = (pair[0] & 0x03) as usize;
        let level = LEVELS[(pair[1] % 5) as usize];
        let acquire = pair[0] & 0x80 == 0;

        if acquire {
            let _ = table.acquire(&mut held[handle], level);
        } else {
            let to = if level >= LockLevel::Shared { LockLevel::Shared } else { LockLevel::None };
            let _ = table.release(&mut held[handle], to);
        }

        let writers = held.iter().filter(|l| **l >= LockLevel::Reserved).count();
        assert!(writers <= 1, "two writers: {:?}", held);
        if held.contains(&LockLevel::Exclusive) {
            let others = held.iter().filter(|l| **l != LockLevel::None).count();
            assert_eq!(others, 1, "exclusive shared with readers: {:?}", held);
        }
    }
});
