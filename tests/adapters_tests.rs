//! Tests for output adapters and the local adapter factory.

use magikworker::adapters::{
    AccumulateAdapter, AdapterFactory, LocalAdapterFactory, OutputMap, ProgressAdapter,
    ProgressSink, ProgressUpdate,
};
use magikworker::stream::{Chunk, Reader, Writer};
use magikworker::task::{InputBinding, OutputBinding};
use magikworker::Error;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct Recorder(Mutex<Vec<ProgressUpdate>>);

impl ProgressSink for Recorder {
    fn update_progress(&self, update: ProgressUpdate) {
        self.0.lock().unwrap().push(update);
    }
}

fn drain(reader: &mut dyn Reader) -> Vec<u8> {
    reader.open().unwrap();
    let mut data = Vec::new();
    loop {
        match reader.read(4).unwrap() {
            Chunk::Data(buf) => data.extend(buf),
            Chunk::Pending => continue,
            Chunk::Eof => break,
        }
    }
    reader.close().unwrap();
    data
}

// =============================================================================
// Accumulate Tests
// =============================================================================

#[test]
fn test_accumulate_concatenates_writes() {
    let map = OutputMap::default();
    let mut adapter = AccumulateAdapter::new(map.clone(), "_stdout");
    adapter.write(b"ab").unwrap();
    adapter.write(b"cd").unwrap();
    adapter.close().unwrap();

    assert_eq!(map.lock().unwrap()["_stdout"], b"abcd");
}

#[test]
fn test_accumulate_registers_key_before_any_write() {
    let map = OutputMap::default();
    let adapter = AccumulateAdapter::new(map.clone(), "_stderr");
    assert_eq!(adapter.key(), "_stderr");
    assert!(map.lock().unwrap()["_stderr"].is_empty());
}

// =============================================================================
// Progress Tests
// =============================================================================

#[test]
fn test_progress_skips_malformed_lines() {
    let recorder = Arc::new(Recorder::default());
    let mut adapter = ProgressAdapter::new(recorder.clone());

    adapter
        .write(b"{\"current\": 3, \"total\": 10}\n{broken\n{\"curr")
        .unwrap();
    adapter.write(b"ent\": 4}\n").unwrap();

    let updates = recorder.0.lock().unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].current, Some(3.0));
    assert_eq!(updates[0].total, Some(10.0));
    assert_eq!(updates[1].current, Some(4.0));
    assert_eq!(updates[1].total, None);
}

#[test]
fn test_progress_drops_partial_line_on_close() {
    let recorder = Arc::new(Recorder::default());
    let mut adapter = ProgressAdapter::new(recorder.clone());
    adapter.write(b"{\"current\": 1}").unwrap();
    adapter.close().unwrap();
    assert!(recorder.0.lock().unwrap().is_empty());
}

#[test]
fn test_progress_ignores_non_object_documents() {
    let recorder = Arc::new(Recorder::default());
    let mut adapter = ProgressAdapter::new(recorder.clone());
    adapter.write(b"[1, 2]\n42\n{\"message\": \"ok\"}\n").unwrap();

    let updates = recorder.0.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].message.as_deref(), Some("ok"));
}

// =============================================================================
// Local Factory Tests
// =============================================================================

#[test]
fn test_local_factory_inline_fetch() {
    let mut reader = LocalAdapterFactory
        .fetch_adapter("x", &InputBinding::inline("inline data"))
        .unwrap();
    assert_eq!(drain(reader.as_mut()), b"inline data");
}

#[test]
fn test_local_factory_file_roundtrip() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source.txt");
    std::fs::write(&source, b"from a file").unwrap();

    let mut reader = LocalAdapterFactory
        .fetch_adapter("in", &InputBinding::local(&source))
        .unwrap();
    let data = drain(reader.as_mut());

    let dest = temp.path().join("dest.txt");
    let mut writer = LocalAdapterFactory
        .push_adapter("out", &OutputBinding::local(&dest))
        .unwrap();
    writer.write(&data).unwrap();
    writer.close().unwrap();

    assert_eq!(std::fs::read(dest).unwrap(), b"from a file");
}

#[test]
fn test_local_factory_rejects_unknown_mode() {
    let binding = InputBinding {
        mode: "girder".into(),
        ..InputBinding::default()
    };
    let err = LocalAdapterFactory.fetch_adapter("x", &binding).err().unwrap();
    assert!(matches!(err, Error::InvalidBinding { ref id, .. } if id == "x"));

    let binding = OutputBinding::named("result.txt");
    assert!(LocalAdapterFactory.push_adapter("y", &binding).is_err());
}
