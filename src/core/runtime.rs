//! Router task: the async loop driving record processing
//!
//! One task owns the router and processes records strictly in arrival order,
//! which keeps every instrument's decode, cycle check and update sequential.
//! Checkpoints are saved as a discrete scoped operation after each emitted
//! snapshot, never interleaved with in-flight processing.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::core::checkpoint::CheckpointStore;
use crate::core::record::Record;
use crate::core::router::InstanceRouter;

/// Consume records until the channel closes or shutdown is signalled.
///
/// Error policy: record-local errors (ordering, binding, missing fields)
/// are logged and the record is discarded; fatal errors stop the task
/// because continuing would deliver results known to be wrong.
///
/// # Arguments
/// * `record_rx` - incoming records in delivery order
/// * `router` - the per-instrument pipelines, already restored
/// * `store` - checkpoint persistence, written once per closed cycle
/// * `output_tx` - broadcast for emitted snapshot records
/// * `shutdown_rx` - broadcast receiver for shutdown signal
pub async fn router_task(
    mut record_rx: mpsc::Receiver<Record>,
    mut router: InstanceRouter,
    store: Arc<dyn CheckpointStore + Send + Sync>,
    output_tx: broadcast::Sender<Record>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!(instruments = router.len(), "router task started");

    let mut processed: u64 = 0;
    let mut emitted: u64 = 0;
    let mut rejected: u64 = 0;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!(processed, emitted, rejected, "router task shutting down");
                break;
            }
            maybe_record = record_rx.recv() => {
                let Some(record) = maybe_record else {
                    info!(processed, emitted, rejected, "record stream closed");
                    break;
                };
                processed += 1;

                let outputs = match router.deliver(&record) {
                    Ok(outputs) => outputs,
                    Err(e) if e.is_fatal() => {
                        error!(
                            instrument = %record.identity.instrument,
                            error = %e,
                            "fatal error, stopping router task"
                        );
                        break;
                    }
                    Err(e) => {
                        rejected += 1;
                        warn!(
                            instrument = %record.identity.instrument,
                            error = %e,
                            "record rejected"
                        );
                        continue;
                    }
                };

                for snapshot in outputs {
                    emitted += 1;
                    if let Err(e) =
                        router.save_checkpoint(&snapshot.identity.instrument, store.as_ref())
                    {
                        error!(
                            instrument = %snapshot.identity.instrument,
                            error = %e,
                            "checkpoint save failed"
                        );
                    }
                    // Send fails only when nobody is subscribed, which is fine.
                    let _ = output_tx.send(snapshot);
                }
            }
        }
    }

    info!("router task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndicatorPeriods, InstrumentConfig, ToleranceConfig};
    use crate::core::channels::ChannelBundle;
    use crate::core::checkpoint::FileCheckpointStore;
    use crate::core::record::{
        FieldValue, InstrumentId, Namespace, RecordIdentity, SourceKind,
    };
    use tempfile::TempDir;
    use tokio::time::{timeout, Duration};

    fn quote(time_mark: i64, close: f64) -> Record {
        Record::new(RecordIdentity {
            source_kind: SourceKind::Quote,
            instrument: InstrumentId::new("DCE", "i<00>"),
            period_seconds: 900,
            namespace: Namespace::Global,
            time_mark,
        })
        .with_field("open", FieldValue::Float(close))
        .with_field("high", FieldValue::Float(close + 1.0))
        .with_field("low", FieldValue::Float(close - 1.0))
        .with_field("close", FieldValue::Float(close))
        .with_field("volume", FieldValue::Float(500.0))
    }

    fn test_router() -> InstanceRouter {
        InstanceRouter::new(
            vec![InstrumentConfig {
                market: "DCE".to_string(),
                code: "i<00>".to_string(),
                period_seconds: 900,
                required_sources: vec![SourceKind::Quote],
                periods: IndicatorPeriods::default(),
            }],
            1,
            ToleranceConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_router_task_emits_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        let bundle = ChannelBundle::new(16);
        let mut outputs = bundle.subscribe_outputs();

        let handle = tokio::spawn(router_task(
            bundle.record_rx,
            test_router(),
            store.clone(),
            bundle.output_tx.clone(),
            bundle.shutdown_tx.subscribe(),
        ));

        bundle.record_tx.send(quote(900, 100.0)).await.unwrap();
        bundle.record_tx.send(quote(1800, 101.0)).await.unwrap();

        let snapshot = timeout(Duration::from_secs(1), outputs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.require_int("cycle_index").unwrap(), 1);

        drop(bundle.record_tx);
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        use crate::core::checkpoint::CheckpointStore as _;
        let saved = store
            .load(&InstrumentId::new("DCE", "i<00>"))
            .unwrap()
            .unwrap();
        assert_eq!(saved.cursor, 1800);
    }

    #[tokio::test]
    async fn test_router_task_survives_out_of_order_record() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        let bundle = ChannelBundle::new(16);
        let mut outputs = bundle.subscribe_outputs();

        let handle = tokio::spawn(router_task(
            bundle.record_rx,
            test_router(),
            store,
            bundle.output_tx.clone(),
            bundle.shutdown_tx.subscribe(),
        ));

        bundle.record_tx.send(quote(1800, 100.0)).await.unwrap();
        bundle.record_tx.send(quote(900, 99.0)).await.unwrap();
        bundle.record_tx.send(quote(2700, 101.0)).await.unwrap();

        // The regressing record is rejected, the stream keeps flowing.
        let snapshot = timeout(Duration::from_secs(1), outputs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.identity.time_mark, 2700);

        drop(bundle.record_tx);
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_router_task_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileCheckpointStore::new(dir.path()));
        let bundle = ChannelBundle::new(16);

        let handle = tokio::spawn(router_task(
            bundle.record_rx,
            test_router(),
            store,
            bundle.output_tx.clone(),
            bundle.shutdown_tx.subscribe(),
        ));

        let _ = bundle.shutdown_tx.send(());
        let result = timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "task should shutdown gracefully");
    }
}
