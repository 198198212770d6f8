#![no_main]
use libfuzzer_sys::{fuzz_target, arbitrary::{Arbitrary, Unstructured}};
use sqlbridge_rs::{MemoryBackend, OpenFlags, Retention, StorageBackend, StorageFile};

#[derive(Debug, Arbitrary)]
enum FileOp {
    Write { offset: u16, data: Vec<u8> },
    Read { offset: u16, len: u8 },
    Truncate { size: u16 },
}

// Memory files must behave like a plain byte vector
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let ops: Vec<FileOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let backend = MemoryBackend::new(Retention::Release);
    let mut file = match backend.open(
        Some("/fuzz/rw.db"),
        OpenFlags::READ_WRITE | OpenFlags::CREATE,
    ) {
        Ok(f) => f,
        Err(_) => return,
    };
    let mut model: Vec<u8> = Vec::new();

    for op in ops.iter().take(64) {
        match op {
            FileOp::Write { offset, data } => {
                let offset = *offset as usize;
                file.write_at(offset as u64, data).unwrap();
                if model.len() < offset + data.len() {
                    model.resize(offset + data.len(), 0);
                }
                model[offset..offset + data.len()].copy_from_slice(data);
            }
            FileOp::Read { offset, len } => {
                let offset = *offset as usize;
                let mut buf = vec![0xAA; *len as usize];
                let n = file.read_at(offset as u64, &mut buf).unwrap();
                let expected = model.get(offset..).unwrap_or(&[]);
                let expected = &expected[..expected.len().min(buf.len())];
                assert_eq!(n, expected.len());
                assert_eq!(&buf[..n], expected);
            }
            FileOp::Truncate { size } => {
                file.truncate(*size as u64).unwrap();
                model.resize(*size as usize, 0);
            }
        }
        assert_eq!(file.file_size().unwrap(), model.len() as u64);
    }

    file.close().unwrap();
});
