use std::sync::Arc;

use libscheduler::{Scheduler, models::PodInput};
use libstore::{DocumentStore, StoreEvent, keys, put_json};
use log::{error, info, warn};
use serde::Deserialize;

/// A pod admission request written to the store by admin tooling. The HTTP
/// surface in front of this is an external collaborator.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Submission {
    #[serde(default = "default_actor")]
    actor: String,
    #[serde(flatten)]
    input: PodInput,
}

fn default_actor() -> String {
    "admin".to_string()
}

/// Watch the submission stream and admit each pod as it appears. The
/// resulting pod record replaces the submission document.
pub fn spawn(store: Arc<dyn DocumentStore>, scheduler: Arc<Scheduler>) {
    tokio::spawn(async move {
        let mut feed = match store.watch(keys::SUBMISSION_PREFIX).await {
            Ok(feed) => feed,
            Err(e) => {
                error!("submission watch failed to start: {e}");
                return;
            }
        };
        while let Some(event) = feed.next().await {
            let StoreEvent::Put { key, value, .. } = event else {
                continue;
            };
            let submission = match serde_json::from_str::<Submission>(&value) {
                Ok(s) => s,
                Err(e) => {
                    warn!("undecodable submission at {key}: {e}");
                    continue;
                }
            };
            match scheduler
                .create_and_schedule(submission.input, &submission.actor)
                .await
            {
                Ok((pod, outcome)) => {
                    info!(
                        "admitted pod {} (scheduled={}, node={:?})",
                        pod.id, outcome.scheduled, outcome.node_id
                    );
                    if let Err(e) =
                        put_json(store.as_ref(), &keys::pod_key(&pod.id), &pod).await
                    {
                        warn!("persisting admitted pod {} failed: {e}", pod.id);
                    }
                    let _ = store.delete(&key).await;
                }
                Err(e) => {
                    warn!("submission at {key} rejected: {e}");
                    let _ = store.delete(&key).await;
                }
            }
        }
    });
}
