#![no_main]
use blockvfs::DirtyPageBuffer;
use libfuzzer_sys::{arbitrary::Arbitrary, fuzz_target};

#[derive(Debug, Arbitrary)]
enum Op {
    Write { offset: u16, data: Vec<u8> },
    Truncate { length: u16 },
    Drain,
    Fold,
}

// The buffer over a base image must always read like a plain Vec<u8>
fuzz_target!(|input: (Vec<u8>, Vec<Op>)| {
    let (base, ops) = input;
    let mut image = base.clone();
    let mut model = base;
    let mut buffer = DirtyPageBuffer::new(model.len() as u64);

    for op in ops.into_iter().take(64) {
        match op {
            Op::Write { offset, data } => {
                let end = offset as usize + data.len();
                if model.len() < end {
                    model.resize(end, 0);
                }
                model[offset as usize..end].copy_from_slice(&data);
                buffer.write(&image, offset as u64, &data);
            }
            Op::Truncate { length } => {
                model.resize(length as usize, 0);
                buffer.truncate(length as u64);
                image.truncate(image.len().min(length as usize));
            }
            Op::Drain => {
                buffer.drain_as_write_ranges();
            }
            Op::Fold => buffer.fold_into(&mut image),
        }

        assert_eq!(buffer.length(), model.len() as u64);
        let mut out = vec![0xAA; model.len() + 7];
        let n = buffer.read(&image, 0, &mut out);
        assert_eq!(n, model.len());
        assert_eq!(&out[..n], &model[..]);
        assert!(out[n..].iter().all(|&b| b == 0));
    }
});
