use criterion::{black_box, criterion_group, criterion_main, Criterion};
use v8unpack::codec::{Codec, DeflateCodec};
use v8unpack::container::{extract_to_dir, ExtractMode};
use v8unpack::{Block, Container};

fn module_text(size: usize) -> Vec<u8> {
    b"Procedure Run(Parameters) Export\r\n\tReturn Parameters;\r\nEndProcedure\r\n"
        .iter()
        .cycle()
        .take(size)
        .copied()
        .collect()
}

fn sample_container(blocks: usize, block_size: usize) -> Container {
    let deflate = DeflateCodec::default();
    let data = deflate.compress(&module_text(block_size)).unwrap();
    let mut container = Container::default();
    for i in 0..blocks {
        container.push(Block::leaf(format!("block{i}"), data.clone())).unwrap();
    }
    container
}

fn bench_deflate(c: &mut Criterion) {
    let data = module_text(1024 * 1024);
    let deflate = DeflateCodec::default();
    let packed = deflate.compress(&data).unwrap();

    c.bench_function("deflate_compress_1mb", |b| b.iter(|| deflate.compress(black_box(&data))));
    c.bench_function("deflate_decompress_1mb", |b| b.iter(|| deflate.decompress(black_box(&packed))));
}

fn bench_container(c: &mut Criterion) {
    let container = sample_container(200, 16 * 1024);
    let bytes = container.to_bytes().unwrap();

    c.bench_function("container_build_200_blocks", |b| b.iter(|| black_box(&container).to_bytes()));
    c.bench_function("container_parse_200_blocks", |b| {
        b.iter(|| Container::parse(black_box(&bytes), false))
    });
    c.bench_function("container_extract_to_dir_200_blocks", |b| {
        b.iter(|| {
            let tmp = tempfile::tempdir().unwrap();
            extract_to_dir(black_box(&bytes), tmp.path(), ExtractMode { compressed: true, recursive: false })
                .unwrap();
        })
    });
}

criterion_group!(benches, bench_deflate, bench_container);
criterion_main!(benches);
