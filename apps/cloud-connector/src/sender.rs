use crate::error::{ConnectorError, TransmissionError};
use crate::reading::Reading;
use crate::sink::SinkAdapter;
use crate::tsdb::TimeSeriesStore;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Fans one reading out to every sink, then stores it tagged with the sinks
/// that took it.
pub struct DataSender {
    sinks: Vec<SinkAdapter>,
    store: Arc<dyn TimeSeriesStore>,
}

impl DataSender {
    pub fn new(sinks: Vec<SinkAdapter>, store: Arc<dyn TimeSeriesStore>) -> Self {
        Self { sinks, store }
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(SinkAdapter::name).collect()
    }

    /// Returns the names of the sinks that accepted the reading, in sink
    /// order. Only a store failure is an error; sink failures are logged.
    pub async fn send(
        &self,
        mut reading: Reading,
        device_name: &str,
    ) -> Result<Vec<String>, ConnectorError> {
        let dropped = reading.retain_finite();
        if !dropped.is_empty() {
            tracing::warn!(device = device_name, measurements = ?dropped, "dropping non-finite values");
        }

        let mut accepted = Vec::with_capacity(self.sinks.len());
        // An empty reading would still count as a send for every policy.
        let sinks: &[SinkAdapter] = if reading.is_empty() {
            tracing::warn!(device = device_name, "reading has no measurements; not sending to clouds");
            &[]
        } else {
            &self.sinks
        };
        for sink in sinks {
            let outcome = AssertUnwindSafe(sink.insert(&reading, device_name))
                .catch_unwind()
                .await
                .unwrap_or(Err(TransmissionError::Panicked));
            match outcome {
                Ok(Some(name)) => accepted.push(name.to_string()),
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(sink = sink.name(), device = device_name, error = %err, "unable to send data to cloud");
                }
            }
        }

        tracing::debug!(device = device_name, clouds = ?accepted, "inserting data into time-series store");
        if !self.store.write(&reading, device_name, &accepted).await? {
            tracing::info!(device = device_name, "data not inserted");
        }
        Ok(accepted)
    }

    pub async fn close(&self) {
        for sink in &self.sinks {
            sink.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyScope, SendPolicy};
    use crate::test_support::{RecordingSink, RecordingStore};
    use std::time::Duration;

    fn adapter(sink: RecordingSink, policy: SendPolicy) -> SinkAdapter {
        SinkAdapter::new(Box::new(sink), policy, PolicyScope::Sink)
    }

    /// Time limit that has already been used up by a prior send.
    fn exhausted_policy() -> SendPolicy {
        let mut policy = SendPolicy::time_limit(Duration::from_secs(3600));
        policy.decide(&Reading::new().with("warmup", 0.0));
        policy
    }

    #[tokio::test]
    async fn store_is_tagged_with_accepting_sinks_in_order() {
        let first = RecordingSink::new("sink1");
        let second = RecordingSink::new("sink2");
        let third = RecordingSink::new("sink3");
        let calls = [first.calls(), second.calls(), third.calls()];
        let store = Arc::new(RecordingStore::new());
        let sender = DataSender::new(
            vec![
                adapter(first, SendPolicy::all()),
                adapter(second, exhausted_policy()),
                adapter(third, SendPolicy::all()),
            ],
            store.clone(),
        );

        let accepted = sender
            .send(Reading::new().with("temp", 25.0), "sim01")
            .await
            .unwrap();

        assert_eq!(accepted, vec!["sink1".to_string(), "sink3".to_string()]);
        let writes = store.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].device, "sim01");
        assert_eq!(writes[0].sinks, vec!["sink1".to_string(), "sink3".to_string()]);
        assert_eq!(calls[0].lock().unwrap().len(), 1);
        assert_eq!(calls[1].lock().unwrap().len(), 0);
        assert_eq!(calls[2].lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_sink_does_not_stop_the_others() {
        let second = RecordingSink::new("sink2");
        let third = RecordingSink::new("sink3");
        let calls = [second.calls(), third.calls()];
        let store = Arc::new(RecordingStore::new());
        let sender = DataSender::new(
            vec![
                adapter(RecordingSink::failing("sink1"), SendPolicy::all()),
                adapter(second, SendPolicy::all()),
                adapter(third, exhausted_policy()),
            ],
            store.clone(),
        );

        let accepted = sender
            .send(Reading::new().with("temp", 25.0), "sim01")
            .await
            .unwrap();

        assert_eq!(accepted, vec!["sink2".to_string()]);
        assert_eq!(calls[0].lock().unwrap().len(), 1);
        assert_eq!(store.writes()[0].sinks, vec!["sink2".to_string()]);
    }

    #[tokio::test]
    async fn panicking_sink_is_isolated() {
        let store = Arc::new(RecordingStore::new());
        let sender = DataSender::new(
            vec![
                adapter(RecordingSink::panicking("boom"), SendPolicy::all()),
                adapter(RecordingSink::new("ok"), SendPolicy::all()),
            ],
            store.clone(),
        );

        let accepted = sender
            .send(Reading::new().with("temp", 25.0), "sim01")
            .await
            .unwrap();

        assert_eq!(accepted, vec!["ok".to_string()]);
        assert_eq!(store.writes().len(), 1);
    }

    #[tokio::test]
    async fn no_sinks_still_stores_reading() {
        let store = Arc::new(RecordingStore::new());
        let sender = DataSender::new(Vec::new(), store.clone());
        let accepted = sender
            .send(Reading::new().with("temp", 25.0), "sim01")
            .await
            .unwrap();
        assert!(accepted.is_empty());
        assert!(store.writes()[0].sinks.is_empty());
    }

    #[tokio::test]
    async fn non_finite_values_never_reach_sinks_or_store() {
        let sink = RecordingSink::new("sink1");
        let calls = sink.calls();
        let store = Arc::new(RecordingStore::new());
        let sender = DataSender::new(vec![adapter(sink, SendPolicy::all())], store.clone());

        sender
            .send(
                Reading::new().with("temp", 25.0).with("broken", f64::NAN),
                "sim01",
            )
            .await
            .unwrap();

        let expected = Reading::new().with("temp", 25.0);
        assert_eq!(calls.lock().unwrap()[0].1, expected);
        assert_eq!(store.writes()[0].reading, expected);
    }

    #[tokio::test]
    async fn empty_reading_does_not_consume_send_window() {
        let sink = RecordingSink::new("sink1");
        let calls = sink.calls();
        let store = Arc::new(RecordingStore::new());
        let sender = DataSender::new(
            vec![adapter(sink, SendPolicy::time_limit(Duration::from_secs(3600)))],
            store.clone(),
        );

        let accepted = sender
            .send(Reading::new().with("broken", f64::INFINITY), "sim01")
            .await
            .unwrap();
        assert!(accepted.is_empty());
        assert!(calls.lock().unwrap().is_empty());

        let accepted = sender
            .send(Reading::new().with("temp", 25.0), "sim01")
            .await
            .unwrap();
        assert_eq!(accepted, vec!["sink1".to_string()]);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let store = Arc::new(RecordingStore::failing());
        let sender = DataSender::new(Vec::new(), store);
        let result = sender.send(Reading::new().with("temp", 1.0), "sim01").await;
        assert!(matches!(result, Err(ConnectorError::Store(_))));
    }
}
