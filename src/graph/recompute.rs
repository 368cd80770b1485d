use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::context::CorrelationId;
use crate::graph::FieldNode;

/// One scheduled batch of condition evaluations, already in topological
/// order. Independent subtrees may be split into separate batches and run in
/// parallel; order only matters within a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RecomputeBatch {
    pub campaign_id: Uuid,
    pub branch_id: Uuid,
    pub as_of: DateTime<Utc>,
    pub nodes: Vec<FieldNode>,
    pub correlation_id: CorrelationId,
}

/// Producer half handed to mutation paths; batches are queued after commit
/// and drained by the worker.
#[derive(Clone)]
pub struct RecomputeQueue {
    sender: mpsc::UnboundedSender<RecomputeBatch>,
}

impl RecomputeQueue {
    pub fn schedule(&self, batch: RecomputeBatch) {
        if batch.nodes.is_empty() {
            return;
        }
        if self.sender.send(batch).is_err() {
            warn!("recompute worker is gone; dropping batch");
        }
    }
}

/// Spawns the worker loop. `handler` performs the actual evaluations; a
/// failed batch is logged and dropped, never retried; the next mutation of
/// the same entity schedules it again.
pub fn spawn_recompute_worker<F>(handler: F) -> (RecomputeQueue, JoinHandle<()>)
where
    F: Fn(RecomputeBatch) -> anyhow::Result<()> + Send + 'static,
{
    let (sender, mut receiver) = mpsc::unbounded_channel::<RecomputeBatch>();
    let handle = tokio::spawn(async move {
        while let Some(batch) = receiver.recv().await {
            let correlation_id = batch.correlation_id;
            let count = batch.nodes.len();
            match handler(batch) {
                Ok(()) => {
                    info!("recomputed {count} node(s) [{correlation_id}]");
                }
                Err(err) => {
                    warn!("recompute batch failed [{correlation_id}]: {err:#}");
                }
            }
        }
    });
    (RecomputeQueue { sender }, handle)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use chrono::TimeZone;

    use crate::entity::{EntityRef, EntityType};

    use super::*;

    fn batch(nodes: Vec<FieldNode>) -> RecomputeBatch {
        RecomputeBatch {
            campaign_id: Uuid::new_v4(),
            branch_id: Uuid::new_v4(),
            as_of: Utc.with_ymd_and_hms(4707, 3, 15, 0, 0, 0).unwrap(),
            nodes,
            correlation_id: CorrelationId::new(),
        }
    }

    fn node(field: &str) -> FieldNode {
        FieldNode::new(EntityRef::new(EntityType::Structure, Uuid::nil()), field)
    }

    #[tokio::test]
    async fn batches_reach_the_handler_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let (queue, handle) = spawn_recompute_worker(move |batch| {
            sink.lock().unwrap().push(batch.nodes);
            Ok(())
        });

        queue.schedule(batch(vec![node("a")]));
        queue.schedule(batch(vec![node("b"), node("c")]));
        drop(queue);
        handle.await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![vec![node("a")], vec![node("b"), node("c")]]);
    }

    #[tokio::test]
    async fn empty_batches_are_not_queued_and_failures_do_not_stop_the_worker() {
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let (queue, handle) = spawn_recompute_worker(move |batch| {
            *sink.lock().unwrap() += 1;
            if batch.nodes.len() == 1 {
                anyhow::bail!("boom");
            }
            Ok(())
        });

        queue.schedule(batch(Vec::new())); // dropped before the queue
        queue.schedule(batch(vec![node("fails")]));
        queue.schedule(batch(vec![node("a"), node("b")]));
        drop(queue);
        handle.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), 2);
    }
}
