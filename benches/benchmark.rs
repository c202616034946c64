use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{DynamicImage, Rgb, RgbImage};
use lazy_region::engine::pyramid::halved_sizes;
use lazy_region::engine::{
    Pipeline, ProcessorConfig, PyramidSelector, Raster, ReaderHints, ReductionFactor, RegionReader,
};
use lazy_region::ops::{Crop, Dimension, Operation, OperationList, Orientation, Scale};
use std::hint::black_box;

fn create_test_image(width: u32, height: u32) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    }))
}

fn bench_planning(c: &mut Criterion) {
    let full = Dimension::from_u32(40_000, 30_000);
    let levels = PyramidSelector::levels_from_sizes(&halved_sizes(40_000, 30_000, 64, 10));
    let crop = Crop::pixels(12_000, 9_000, 8_000, 6_000);
    let scale = Scale::fit_inside(512, 512);

    c.bench_function("for_scale", |b| {
        b.iter(|| ReductionFactor::for_scale(black_box(0.013), black_box(8)))
    });

    c.bench_function("select_and_plan", |b| {
        b.iter(|| {
            let selection = PyramidSelector::select(full, &levels, &crop, &scale);
            let level = &levels[selection.level_index];
            RegionReader::plan(full, level, selection.factor, &crop, &scale)
        })
    });
}

fn bench_pipeline_scale(c: &mut Criterion) {
    let config = ProcessorConfig::default();
    let mut group = c.benchmark_group("pipeline_scale");
    for size in [512u32, 2048] {
        let source = Raster::new(create_test_image(size, size));
        let ops = OperationList::default().with(Operation::Scale(Scale::fit_width(256)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &source, |b, source| {
            b.iter(|| {
                Pipeline::new(&config)
                    .run(
                        source.clone(),
                        &ops,
                        Dimension::from_u32(size, size),
                        ReductionFactor::default(),
                        ReaderHints::empty(),
                        Orientation::Rotate0,
                    )
                    .unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_planning, bench_pipeline_scale);
criterion_main!(benches);
