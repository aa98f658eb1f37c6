//! End-to-end tests for the data handler pipeline: producing events,
//! processing, persistence, eviction, and failure surfacing.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use acq_engine::{
    AxisValue, DataBuffer, DataCoordinateIterator, DataCoordinates, DataHandler, DataItem, Engine,
    EngineError, EventContext, ExecutorEvent, MemoryStorage, NotificationFilter, Processed,
    StorageBackend, DATA_STORED, STORAGE_FAILED,
};

fn coords(time: usize) -> DataCoordinates {
    DataCoordinates::new().with("time", time)
}

/// Event producing a short time series, then holding its future open until
/// the test releases it.
struct AcquireSeries {
    handler: Arc<DataHandler>,
    frames: usize,
    gate: Option<mpsc::Receiver<()>>,
}

impl ExecutorEvent for AcquireSeries {
    type Output = usize;

    fn execute(&mut self, ctx: &EventContext) -> anyhow::Result<usize> {
        for i in 0..self.frames {
            ctx.put_data(coords(i), vec![i as u8], json!({}))?;
        }
        if let Some(gate) = &self.gate {
            gate.recv().ok();
        }
        Ok(self.frames)
    }

    fn data_handler(&self) -> Option<Arc<DataHandler>> {
        Some(Arc::clone(&self.handler))
    }

    fn coordinate_iterator(&self) -> Option<DataCoordinateIterator> {
        Some(DataCoordinateIterator::finite(
            (0..self.frames).map(coords),
        ))
    }
}

#[test]
fn test_data_round_trip() {
    let engine = Engine::with_defaults();
    let handler = DataHandler::new(&engine, MemoryStorage::new());
    let (gate_tx, gate_rx) = mpsc::channel();

    let future = engine
        .submit(AcquireSeries {
            handler: Arc::clone(&handler),
            frames: 10,
            gate: Some(gate_rx),
        })
        .expect("submit");

    // data is visible through the future while the event is still running
    let (data, metadata) = future
        .await_data(&coords(5), true, true, Some(Duration::from_secs(5)))
        .expect("await_data");
    assert_eq!(data, Some(DataBuffer::U8(vec![5])));
    assert_eq!(metadata, Some(json!({})));
    assert!(!future.is_execution_complete());

    gate_tx.send(()).expect("gate");
    assert_eq!(future.await_execution(None).expect("execution"), 10);
    future
        .await_notification(DATA_STORED, Some(Duration::from_secs(5)))
        .expect("stored notification on the producing future");

    handler.finish().expect("finish");
    handler
        .await_completion(Some(Duration::from_secs(5)))
        .expect("flush");

    // persisted items were evicted from memory; get falls back to storage
    let (data, _) = handler
        .get(&coords(9), true, false, Some(Duration::from_secs(1)))
        .expect("get from storage");
    assert_eq!(data, Some(DataBuffer::U8(vec![9])));

    // provably-impossible coordinates fail fast
    assert!(matches!(
        future.await_data(&coords(42), true, false, None),
        Err(EngineError::UnknownCoordinates(_))
    ));
    engine.shutdown(true);
}

#[test]
fn test_await_data_batch_preserves_order() {
    let engine = Engine::with_defaults();
    let handler = DataHandler::new(&engine, MemoryStorage::new());

    let future = engine
        .submit(AcquireSeries {
            handler: Arc::clone(&handler),
            frames: 4,
            gate: None,
        })
        .expect("submit");

    let wanted = [coords(3), coords(1), coords(2)];
    let results = future
        .await_data_batch(&wanted, true, false, Some(Duration::from_secs(5)))
        .expect("await_data_batch");
    let payloads: Vec<_> = results.into_iter().map(|(data, _)| data).collect();
    assert_eq!(
        payloads,
        vec![
            Some(DataBuffer::U8(vec![3])),
            Some(DataBuffer::U8(vec![1])),
            Some(DataBuffer::U8(vec![2])),
        ]
    );
    future.await_execution(None).expect("execution");
    engine.shutdown(true);
}

#[test]
fn test_processor_expansion() {
    let engine = Engine::with_defaults();
    let handler = DataHandler::with_processor(&engine, MemoryStorage::new(), |item: DataItem| {
        let split = |channel: &str| {
            let mut coords = item.coords.clone();
            coords.insert("channel", channel);
            DataItem::new(coords, item.data.clone(), json!({ "channel": channel }))
        };
        Processed::Many(vec![split("A"), split("B")])
    });

    handler
        .put(coords(0), b"x".to_vec(), json!({}))
        .expect("put");
    handler.finish().expect("finish");
    handler
        .await_completion(Some(Duration::from_secs(5)))
        .expect("flush");

    for channel in ["A", "B"] {
        let key = coords(0).with("channel", channel);
        let (data, metadata) = handler
            .get(&key, true, true, Some(Duration::from_secs(1)))
            .expect("processed output stored");
        assert_eq!(data, Some(DataBuffer::U8(b"x".to_vec())));
        assert_eq!(metadata.expect("metadata")["channel"], channel);
    }

    // the un-suffixed input coordinates were replaced by the processor
    assert!(matches!(
        handler.get(&coords(0), true, false, Some(Duration::from_millis(100))),
        Err(EngineError::UnknownCoordinates(_))
    ));
    engine.shutdown(true);
}

#[test]
fn test_processor_can_drop_items() {
    let engine = Engine::with_defaults();
    let handler = DataHandler::with_processor(&engine, MemoryStorage::new(), |item: DataItem| {
        let keep = matches!(item.coords.get("time"), Some(AxisValue::Int(0)));
        if keep {
            Processed::One(item)
        } else {
            Processed::Drop
        }
    });

    handler.put(coords(0), vec![0u8], json!({})).expect("put");
    handler.put(coords(1), vec![1u8], json!({})).expect("put");
    handler.finish().expect("finish");
    handler
        .await_completion(Some(Duration::from_secs(5)))
        .expect("flush");

    assert!(handler
        .get(&coords(0), true, false, Some(Duration::from_secs(1)))
        .is_ok());
    assert!(matches!(
        handler.get(&coords(1), true, false, Some(Duration::from_millis(100))),
        Err(EngineError::UnknownCoordinates(_))
    ));
    engine.shutdown(true);
}

struct BrokenStorage;

impl StorageBackend for BrokenStorage {
    fn put(
        &mut self,
        _coords: &DataCoordinates,
        _data: &DataBuffer,
        _metadata: &serde_json::Value,
    ) -> anyhow::Result<()> {
        anyhow::bail!("disk full")
    }

    fn get_data(&self, _coords: &DataCoordinates) -> Option<DataBuffer> {
        None
    }

    fn get_metadata(&self, _coords: &DataCoordinates) -> Option<serde_json::Value> {
        None
    }

    fn contains(&self, _coords: &DataCoordinates) -> bool {
        false
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[test]
fn test_storage_failure_is_latched_and_announced() {
    let engine = Engine::with_defaults();
    let (tx, rx) = mpsc::channel();
    engine.subscribe_to_notifications(
        move |n| {
            tx.send(n.kind.clone()).ok();
        },
        NotificationFilter::Kind(STORAGE_FAILED.to_string()),
    );

    let handler = DataHandler::new(&engine, BrokenStorage);
    handler.put(coords(0), vec![0u8], json!({})).expect("put");

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).expect("announcement"),
        STORAGE_FAILED
    );

    // the failure surfaces on every subsequent call
    let err = loop {
        match handler.put(coords(1), vec![1u8], json!({})) {
            Err(err) => break err,
            Ok(()) => std::thread::sleep(Duration::from_millis(10)),
        }
    };
    assert!(matches!(err, EngineError::Storage(_)));
    assert!(matches!(
        handler.get(&coords(0), true, false, None),
        Err(EngineError::Storage(_))
    ));
    assert!(matches!(handler.finish(), Err(EngineError::Storage(_))));
    engine.shutdown(true);
}

#[test]
fn test_put_after_finish_is_rejected() {
    let engine = Engine::with_defaults();
    let handler = DataHandler::new(&engine, MemoryStorage::new());

    handler.put(coords(0), vec![0u8], json!({})).expect("put");
    handler.finish().expect("finish");
    assert!(matches!(
        handler.put(coords(1), vec![1u8], json!({})),
        Err(EngineError::UnknownCoordinates(_))
    ));
    handler
        .await_completion(Some(Duration::from_secs(5)))
        .expect("flush");
    engine.shutdown(true);
}

#[test]
fn test_pinned_items_survive_eviction() {
    let engine = Engine::with_defaults();
    let (tx, rx) = mpsc::channel();
    engine.subscribe_to_notifications(
        move |_| {
            tx.send(()).ok();
        },
        NotificationFilter::Kind(DATA_STORED.to_string()),
    );

    let handler = DataHandler::new(&engine, MemoryStorage::new());
    handler.pin(&coords(0));
    handler.put(coords(0), vec![1u8, 2, 3], json!({})).expect("put");
    rx.recv_timeout(Duration::from_secs(2)).expect("stored");

    // persisted but pinned: still resident in memory
    assert_eq!(handler.memory_bytes(), 3);
    handler.unpin(&coords(0));
    assert_eq!(handler.memory_bytes(), 0);

    // still reachable through storage after eviction
    let (data, _) = handler
        .get(&coords(0), true, false, Some(Duration::from_secs(1)))
        .expect("get");
    assert_eq!(data, Some(DataBuffer::U8(vec![1, 2, 3])));
    engine.shutdown(true);
}

#[test]
fn test_get_timeout_leaves_state_unchanged() {
    let engine = Engine::with_defaults();
    let handler = DataHandler::new(&engine, MemoryStorage::new());

    assert!(matches!(
        handler.get(&coords(7), true, false, Some(Duration::from_millis(50))),
        Err(EngineError::Timeout(_))
    ));

    // the wait changed nothing: a later put still satisfies the coords
    handler.put(coords(7), vec![7u8], json!({})).expect("put");
    let (data, _) = handler
        .get(&coords(7), true, false, Some(Duration::from_secs(1)))
        .expect("get");
    assert_eq!(data, Some(DataBuffer::U8(vec![7])));
    engine.shutdown(true);
}
