use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use texplorer_engine::EventChannels;

use crate::client::ClientRegistry;

/// Serialize one channel event for clients following `project`.
pub fn wire_event<E: Serialize>(project: &str, channel: &str, event: &E) -> Option<String> {
    serde_json::to_string(&serde_json::json!({
        "type": "event",
        "project": project,
        "channel": channel,
        "event": event,
    }))
    .ok()
}

enum Step<T> {
    Event(T),
    Skip,
    Stop,
}

fn step<T>(project: &str, channel: &str, received: Result<T, broadcast::error::RecvError>) -> Step<T> {
    match received {
        Ok(event) => Step::Event(event),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            tracing::warn!(project, channel, skipped = n, "event bridge lagged, dropped events");
            Step::Skip
        }
        Err(broadcast::error::RecvError::Closed) => Step::Stop,
    }
}

fn forward<E: Serialize>(registry: &ClientRegistry, project: &str, channel: &str, event: &E) {
    match wire_event(project, channel, event) {
        Some(json) => {
            registry.broadcast_to_project(project, &json);
        }
        None => tracing::warn!(project, channel, "failed to serialize event"),
    }
}

/// Forward whatever is still queued on `rx`.
fn drain<E: Serialize + Clone>(
    rx: &mut broadcast::Receiver<E>,
    registry: &ClientRegistry,
    project: &str,
    channel: &str,
) {
    loop {
        match rx.try_recv() {
            Ok(event) => forward(registry, project, channel, &event),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::warn!(project, channel, skipped = n, "event bridge lagged, dropped events");
            }
            Err(_) => break,
        }
    }
}

/// Forward a project's load, run and retire channels to its WebSocket
/// followers until the channels close. Events emitted before the close are
/// still delivered.
pub fn start(
    project: String,
    channels: Arc<EventChannels>,
    registry: Arc<ClientRegistry>,
) -> tokio::task::JoinHandle<()> {
    let mut load = channels.load.subscribe();
    let mut run = channels.run.subscribe();
    let mut retire = channels.retire.subscribe();
    let closed = channels.close_token();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = closed.cancelled() => {
                    drain(&mut load, &registry, &project, "load");
                    drain(&mut run, &registry, &project, "run");
                    drain(&mut retire, &registry, &project, "retire");
                    break;
                }
                received = load.recv() => match step(&project, "load", received) {
                    Step::Event(e) => forward(&registry, &project, "load", &e),
                    Step::Skip => {}
                    Step::Stop => break,
                },
                received = run.recv() => match step(&project, "run", received) {
                    Step::Event(e) => forward(&registry, &project, "run", &e),
                    Step::Skip => {}
                    Step::Stop => break,
                },
                received = retire.recv() => match step(&project, "retire", received) {
                    Step::Event(e) => forward(&registry, &project, "retire", &e),
                    Step::Skip => {}
                    Step::Stop => break,
                },
            }
        }
        tracing::debug!(project = %project, "event bridge stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use texplorer_core::events::{LoadEvent, RetireEvent, RunEvent};
    use texplorer_core::ids::{GenerationId, RunId, TestId};

    #[test]
    fn wire_event_wraps_payload() {
        let json = wire_event("texplorer.demo", "retire", &RetireEvent::all()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["project"], "texplorer.demo");
        assert_eq!(value["channel"], "retire");
        assert_eq!(value["event"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn forwards_to_followers_and_stops_on_close() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (follower, mut rx) = registry.register();
        let (_other, mut other_rx) = registry.register();
        registry.subscribe(&follower, "texplorer.demo");

        let channels = Arc::new(EventChannels::default());
        let handle = start("texplorer.demo".into(), Arc::clone(&channels), Arc::clone(&registry));

        channels.load.emit(LoadEvent::Started {
            generation: GenerationId::new(),
        });
        channels
            .retire
            .emit(RetireEvent::tests(vec![TestId::from("math::add")]));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.contains("load_started"));
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(second.contains("math::add"));
        assert!(other_rx.try_recv().is_err());

        channels.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn events_emitted_before_close_are_delivered() {
        let registry = Arc::new(ClientRegistry::new(32));
        let (follower, mut rx) = registry.register();
        registry.subscribe(&follower, "texplorer.demo");

        let channels = Arc::new(EventChannels::default());
        let handle = start("texplorer.demo".into(), Arc::clone(&channels), Arc::clone(&registry));

        let generation = GenerationId::new();
        channels.run.emit(RunEvent::Finished {
            generation: generation.clone(),
            run_id: RunId::new(),
            error: None,
        });
        channels.load.emit(LoadEvent::Started { generation });
        channels.close();
        handle.await.unwrap();

        let mut delivered = Vec::new();
        while let Ok(json) = rx.try_recv() {
            delivered.push(json);
        }
        assert_eq!(delivered.len(), 2);
        assert!(delivered.iter().any(|j| j.contains("\"channel\":\"run\"")));
        assert!(delivered.iter().any(|j| j.contains("load_started")));
    }
}
