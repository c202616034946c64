//! Regression tests for malformed inputs.
//! Each test should be cheap (single input) and run in the normal test suite.

use lazy_region::engine::decoder::{decode_jpeg_mozjpeg, decode_with_image_crate};
use lazy_region::engine::ByteSource;
use lazy_region::ops::{EncodeOptions, Operation, OperationList, OutputFormat};
use lazy_region::{inspect, FormatRegistry, LazyRegionError, Processor, ProcessorConfig};

fn processor() -> Processor {
    Processor::new(
        ProcessorConfig::default().with_threads(1),
        FormatRegistry::default(),
    )
    .unwrap()
}

#[test]
fn fuzz_regression_magic_only_inputs_rejected() {
    let inputs: [&[u8]; 4] = [
        &[0xFF, 0xD8, 0xFF],
        &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A],
        b"GIF89a",
        b"RIFF\0\0\0\0WEBP",
    ];
    for data in inputs {
        // Header inspection should never panic.
        assert!(inspect(data).is_err(), "accepted {data:?}");
        let ops = OperationList::default()
            .with(Operation::Encode(EncodeOptions::new(OutputFormat::Png)));
        assert!(processor()
            .process_source(ByteSource::from_vec(data.to_vec()), &ops, &mut Vec::new())
            .is_err());
    }
}

#[test]
fn fuzz_regression_truncated_jpeg_does_not_panic() {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    data.extend_from_slice(b"JFIF\0");
    data.extend_from_slice(&[0xFF; 64]);

    // Either outcome is fine; unwinding out of the decoder is not.
    let _ = decode_jpeg_mozjpeg(&data, 8);
    let _ = decode_with_image_crate(&data);
}

#[test]
fn fuzz_regression_unknown_signature_is_unsupported() {
    let data: Vec<u8> = (0u8..=255).cycle().skip(7).take(512).collect();
    let err = processor()
        .process_source(ByteSource::from_vec(data), &OperationList::default(), &mut Vec::new())
        .unwrap_err();
    assert!(matches!(err, LazyRegionError::UnsupportedSourceFormat { .. }));
}
