use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use v8unpack::block::{PageHeader, PAGE_HEADER_SIZE};
use v8unpack::codec::{Codec, DeflateCodec};
use v8unpack::header::{END_MARKER, HEADER_SIZE};
use v8unpack::metadata::PropertyTable;
use v8unpack::organizer;
use v8unpack::pool::WorkerPool;
use v8unpack::structure::kind::encode_wide;
use v8unpack::version::TextEncoding;
use v8unpack::{
    build, extract, load_index, Block, BuildOptions, Container, ContainerHeader, ExtractOptions, IndexMapping,
};

fn table(entries: &[(&str, &[u8])]) -> Vec<u8> {
    PropertyTable { entries: entries.iter().map(|(k, v)| (k.to_string(), v.to_vec())).collect() }
        .to_bytes("test")
        .unwrap()
}

fn stamped(mut block: Block, ctime: u64, mtime: u64) -> Block {
    block.ctime = ctime;
    block.mtime = mtime;
    block
}

/// Root container: `meta` table, `text1` wide text and a `dlg` form, all deflated.
fn sample() -> Vec<u8> {
    let deflate = DeflateCodec::default();

    let mut form = Container::default();
    form.push(Block::leaf("form", table(&[("name", b"Main")]))).unwrap();
    form.push(Block::leaf("module", b"\xEF\xBB\xBFProcedure Run()\r\nEndProcedure".to_vec())).unwrap();

    let mut root = Container::default();
    let meta = table(&[("kind", b"form"), ("compat", &[2])]);
    root.push(stamped(Block::leaf("meta", deflate.compress(&meta).unwrap()), 0x01D0_0000_0000_0001, 0x01D0_0000_0000_0002))
        .unwrap();
    let text = encode_wide("Hello", TextEncoding::Utf16).unwrap();
    root.push(Block::leaf("text1", deflate.compress(&text).unwrap())).unwrap();
    root.push(Block::leaf("dlg", deflate.compress(&form.to_bytes().unwrap()).unwrap())).unwrap();
    root.to_bytes().unwrap()
}

/// The same `meta` and `text1` blocks stored without compression.
fn plain_sample() -> Vec<u8> {
    let mut root = Container::default();
    root.push(Block::leaf("meta", table(&[("kind", b"form"), ("compat", &[2])]))).unwrap();
    root.push(Block::leaf("text1", encode_wide("Hello", TextEncoding::Utf16).unwrap())).unwrap();
    root.to_bytes().unwrap()
}

fn page(out: &mut Vec<u8>, doc_size: u32, size: u32, chained: bool, body: &[u8]) {
    let next_page = if chained { (out.len() + PAGE_HEADER_SIZE + size as usize) as u32 } else { END_MARKER };
    PageHeader { doc_size, page_size: size, next_page }.write(&mut *out).unwrap();
    out.extend_from_slice(body);
    out.resize(out.len() + size as usize - body.len(), 0);
}

/// One `text1` block laid out the way another writer might: TOC and data
/// split over two pages each, reserved words set, name padded.
fn paged_sample() -> Vec<u8> {
    let text = encode_wide("Hello, paged world", TextEncoding::Utf16).unwrap();
    let mut record = Vec::new();
    record.extend_from_slice(&1u64.to_le_bytes());
    record.extend_from_slice(&2u64.to_le_bytes());
    record.extend_from_slice(&5u32.to_le_bytes());
    for unit in "text1".encode_utf16() {
        record.extend_from_slice(&unit.to_le_bytes());
    }
    record.extend_from_slice(&[0, 0]);
    record.extend_from_slice(&9u32.to_le_bytes());

    let header_addr = (HEADER_SIZE + 2 * (PAGE_HEADER_SIZE + 8)) as u32;
    let data_addr = header_addr + (PAGE_HEADER_SIZE + record.len()) as u32;
    let toc: Vec<u8> = [header_addr, data_addr, 0].iter().flat_map(|w| w.to_le_bytes()).collect();

    let mut out = Vec::new();
    ContainerHeader::with_layout(16, 0, 0x11).write(&mut out).unwrap();
    page(&mut out, 12, 8, true, &toc[..8]);
    page(&mut out, 0, 8, false, &toc[8..]);
    page(&mut out, record.len() as u32, record.len() as u32, false, &record);
    page(&mut out, text.len() as u32, 24, true, &text[..24]);
    page(&mut out, 0, 24, false, &text[24..]);
    out
}

struct Workspace {
    tmp: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let ws = Self { tmp: tempfile::tempdir().unwrap() };
        fs::write(ws.path("in.epf"), sample()).unwrap();
        ws
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.tmp.path().join(rel)
    }
}

fn tree(root: &Path) -> Vec<(String, Vec<u8>)> {
    v8unpack::fsutil::walk_files(root)
        .unwrap()
        .into_iter()
        .map(|(rel, path)| (rel, fs::read(path).unwrap()))
        .collect()
}

#[test]
fn test_meta_and_text_scenario() {
    let ws = Workspace::new();
    let report = extract(&ws.path("in.epf"), &ws.path("src"), &ExtractOptions::default());
    assert!(report.success, "{}", report.status_line());

    assert_eq!(fs::read_to_string(ws.path("src/meta.json")).unwrap(), r#"{"kind":"form","compat":2}"#);
    assert_eq!(fs::read_to_string(ws.path("src/text1.txt")).unwrap(), "Hello");
    assert!(ws.path("src/dlg/module.bsl").is_file());
    assert!(ws.path("src/.container.json").is_file());

    let report = build(&ws.path("src"), &ws.path("out.epf"), &BuildOptions::default());
    assert!(report.success, "{}", report.status_line());
    assert_eq!(fs::read(ws.path("out.epf")).unwrap(), sample());
}

#[test]
fn test_unpack_is_idempotent() {
    let ws = Workspace::new();
    let options = ExtractOptions { temp_dir: Some(ws.path("tmp")), ..ExtractOptions::default() };
    assert!(extract(&ws.path("in.epf"), &ws.path("src"), &options).success);
    let first = tree(&ws.path("src"));
    fs::write(ws.path("src/leftover.txt"), b"stale").unwrap();
    assert!(extract(&ws.path("in.epf"), &ws.path("src"), &options).success);
    assert_eq!(tree(&ws.path("src")), first);
}

#[test]
fn test_index_redirects_into_common_folder() {
    let ws = Workspace::new();
    fs::write(ws.path("index.json"), r#"{"dlg/module.bsl": "common/run.bsl"}"#).unwrap();

    let options = ExtractOptions { index: Some(ws.path("index.json")), ..ExtractOptions::default() };
    assert!(extract(&ws.path("in.epf"), &ws.path("src"), &options).success);
    assert!(ws.path("src/common/run.bsl").is_file());
    assert!(!ws.path("src/dlg/module.bsl").exists());

    let options = BuildOptions { index: Some(ws.path("index.json")), ..BuildOptions::default() };
    assert!(build(&ws.path("src"), &ws.path("out.epf"), &options).success);
    assert_eq!(fs::read(ws.path("out.epf")).unwrap(), sample());
}

#[test]
fn test_organizer_places_mapped_file() {
    let tmp = tempfile::tempdir().unwrap();
    let typed = tmp.path().join("typed");
    v8unpack::fsutil::write(&typed.join("a/b.txt"), b"shared").unwrap();
    let index = IndexMapping::from_pairs([("a/b.txt", "common/b.txt")]);
    organizer::unpack(&typed, &tmp.path().join("out"), &index, &WorkerPool::new(2).unwrap()).unwrap();
    assert_eq!(fs::read(tmp.path().join("out/common/b.txt")).unwrap(), b"shared");
    assert!(!tmp.path().join("out/a/b.txt").exists());
}

#[test]
fn test_toc_past_end_of_file_is_malformed() {
    let ws = Workspace::new();
    let mut bytes = sample();
    // data address of the first TOC entry
    bytes[51..55].copy_from_slice(&0x00FF_FFFFu32.to_le_bytes());
    fs::write(ws.path("bad.epf"), &bytes).unwrap();

    let report = extract(&ws.path("bad.epf"), &ws.path("src"), &ExtractOptions::default());
    assert!(!report.success);
    assert!(report.error.unwrap().contains("Malformed container"));
    assert!(!ws.path("src").exists());
}

#[test]
fn test_index_merge_last_wins() {
    let ws = Workspace::new();
    fs::create_dir(ws.path("idx")).unwrap();
    fs::write(ws.path("idx/first.json"), r#"{"k": "a", "x": "1"}"#).unwrap();
    fs::write(ws.path("idx/second.json"), r#"{"k": "b", "y": "2"}"#).unwrap();
    fs::write(ws.path("idx/main.json"), r#"{"index.json": ["first.json", "second.json"], "y": "3"}"#).unwrap();

    let index = load_index(&ws.path("idx/main.json")).unwrap();
    assert_eq!(index.get("k"), Some("b"));
    assert_eq!(index.get("x"), Some("1"));
    assert_eq!(index.get("y"), Some("3"));

    fs::write(ws.path("idx/missing.json"), r#"{"index.json": ["nope.json"]}"#).unwrap();
    assert!(matches!(load_index(&ws.path("idx/missing.json")), Err(v8unpack::Error::IndexLoad { .. })));
}

#[test]
fn test_empty_index_aborts_but_absent_index_does_not() {
    let ws = Workspace::new();
    fs::write(ws.path("empty.json"), "{}").unwrap();
    fs::write(ws.path("main.json"), r#"{"index.json": ["empty.json"], "meta.json": "m.json"}"#).unwrap();

    for index in ["empty.json", "main.json"] {
        let options = ExtractOptions { index: Some(ws.path(index)), ..ExtractOptions::default() };
        let report = extract(&ws.path("in.epf"), &ws.path("src"), &options);
        assert!(!report.success, "{index}");
        assert!(report.error.unwrap().contains("empty"));
        assert!(!ws.path("src").exists());
    }

    assert!(extract(&ws.path("in.epf"), &ws.path("src"), &ExtractOptions::default()).success);
}

#[test]
fn test_descent_layers() {
    let ws = Workspace::new();
    let base = ExtractOptions { descent: Some("3".into()), ..ExtractOptions::default() };
    assert!(extract(&ws.path("in.epf"), &ws.path("src"), &base).success);
    assert!(ws.path("src/3/text1.txt").is_file());

    let derived = ExtractOptions { descent: Some("3.1".into()), ..ExtractOptions::default() };
    assert!(extract(&ws.path("in.epf"), &ws.path("src"), &derived).success);
    assert!(tree(&ws.path("src/3.1")).is_empty());

    let options = BuildOptions { descent: Some("3.1".into()), ..BuildOptions::default() };
    assert!(build(&ws.path("src"), &ws.path("same.epf"), &options).success);
    assert_eq!(fs::read(ws.path("same.epf")).unwrap(), sample());

    fs::write(ws.path("src/3.1/text1.txt"), "Bye").unwrap();
    assert!(build(&ws.path("src"), &ws.path("derived.epf"), &options).success);
    assert!(extract(&ws.path("derived.epf"), &ws.path("check"), &ExtractOptions::default()).success);
    assert_eq!(fs::read_to_string(ws.path("check/text1.txt")).unwrap(), "Bye");

    // the base layer still builds the original
    let options = BuildOptions { descent: Some("3".into()), ..BuildOptions::default() };
    assert!(build(&ws.path("src"), &ws.path("base.epf"), &options).success);
    assert_eq!(fs::read(ws.path("base.epf")).unwrap(), sample());
}

#[test]
fn test_gui_override() {
    let ws = Workspace::new();
    assert!(extract(&ws.path("in.epf"), &ws.path("src"), &ExtractOptions::default()).success);
    let options = BuildOptions { gui: Some(1), ..BuildOptions::default() };
    assert!(build(&ws.path("src"), &ws.path("out.epf"), &options).success);

    assert!(extract(&ws.path("out.epf"), &ws.path("check"), &ExtractOptions::default()).success);
    assert_eq!(fs::read_to_string(ws.path("check/meta.json")).unwrap(), r#"{"kind":"form","compat":1}"#);
    assert_eq!(
        fs::read_to_string(ws.path("src/meta.json")).unwrap(),
        r#"{"kind":"form","compat":2}"#,
        "source tree is never rewritten"
    );
}

#[test]
fn test_legacy_version_rejects_astral_text() {
    let ws = Workspace::new();
    let options = ExtractOptions { version: "802".into(), ..ExtractOptions::default() };
    assert!(extract(&ws.path("in.epf"), &ws.path("src"), &options).success);
    fs::write(ws.path("src/text1.txt"), "clef 𝄞").unwrap();

    let options = BuildOptions { version: "802".into(), ..BuildOptions::default() };
    let report = build(&ws.path("src"), &ws.path("out.epf"), &options);
    assert!(!report.success);
    assert!(report.error.unwrap().contains("cannot be encoded"));
    assert!(!ws.path("out.epf").exists());
}

#[test]
fn test_uncompressed_blocks_pass_through() {
    let ws = Workspace::new();
    fs::write(ws.path("plain.epf"), plain_sample()).unwrap();
    let report = extract(&ws.path("plain.epf"), &ws.path("src"), &ExtractOptions::default());
    assert!(report.success, "{}", report.status_line());
    assert_eq!(fs::read_to_string(ws.path("src/meta.json")).unwrap(), r#"{"kind":"form","compat":2}"#);
    assert_eq!(fs::read_to_string(ws.path("src/text1.txt")).unwrap(), "Hello");

    let report = build(&ws.path("src"), &ws.path("out.epf"), &BuildOptions::default());
    assert!(report.success, "{}", report.status_line());
    assert_eq!(fs::read(ws.path("out.epf")).unwrap(), plain_sample());
}

#[test]
fn test_block_named_like_another_blocks_file() {
    let ws = Workspace::new();
    let mut root = Container::default();
    root.push(Block::leaf("a", b"\x06\x01 block a".to_vec())).unwrap();
    root.push(Block::leaf("a.json", b"\x06\x02 block a.json".to_vec())).unwrap();
    let original = root.to_bytes().unwrap();
    fs::write(ws.path("pair.epf"), &original).unwrap();

    assert!(extract(&ws.path("pair.epf"), &ws.path("src"), &ExtractOptions::default()).success);
    assert_eq!(fs::read(ws.path("src/a.bin")).unwrap(), b"\x06\x01 block a");
    assert_eq!(fs::read(ws.path("src/a.json~1.bin")).unwrap(), b"\x06\x02 block a.json");

    let report = build(&ws.path("src"), &ws.path("out.epf"), &BuildOptions::default());
    assert!(report.success, "{}", report.status_line());
    assert_eq!(fs::read(ws.path("out.epf")).unwrap(), original);
}

#[test]
fn test_descent_keeps_existing_layer_files() {
    let ws = Workspace::new();
    fs::create_dir_all(ws.path("src/3")).unwrap();
    fs::write(ws.path("src/3/mine.txt"), "kept").unwrap();

    let options = ExtractOptions { descent: Some("3".into()), ..ExtractOptions::default() };
    assert!(extract(&ws.path("in.epf"), &ws.path("src"), &options).success);
    assert_eq!(fs::read_to_string(ws.path("src/3/mine.txt")).unwrap(), "kept");
    assert!(ws.path("src/3/text1.txt").is_file());

    let options = BuildOptions { descent: Some("3".into()), ..BuildOptions::default() };
    assert!(build(&ws.path("src"), &ws.path("out.epf"), &options).success);
    assert_eq!(fs::read(ws.path("out.epf")).unwrap(), sample());
}

#[test]
fn test_multi_page_container_rebuilds_identically() {
    let ws = Workspace::new();
    fs::write(ws.path("paged.epf"), paged_sample()).unwrap();
    let report = extract(&ws.path("paged.epf"), &ws.path("src"), &ExtractOptions::default());
    assert!(report.success, "{}", report.status_line());
    assert_eq!(fs::read_to_string(ws.path("src/text1.txt")).unwrap(), "Hello, paged world");

    let report = build(&ws.path("src"), &ws.path("out.epf"), &BuildOptions::default());
    assert!(report.success, "{}", report.status_line());
    assert_eq!(fs::read(ws.path("out.epf")).unwrap(), paged_sample());

    // once the text outgrows the recorded pages it gets a single page
    fs::write(ws.path("src/text1.txt"), "Hello, paged world, now much longer than before").unwrap();
    assert!(build(&ws.path("src"), &ws.path("grown.epf"), &BuildOptions::default()).success);
    assert!(extract(&ws.path("grown.epf"), &ws.path("check"), &ExtractOptions::default()).success);
    assert_eq!(
        fs::read_to_string(ws.path("check/text1.txt")).unwrap(),
        "Hello, paged world, now much longer than before"
    );
}
