//! Aggregated event stream (SSE)

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use chrono::Utc;
use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use tracing::{debug, info, warn};

use crate::domain::events::{parse_topics, Topic, TopicEvent, SYSTEM_TOPIC};
use crate::domain::types::ProcessEvent;
use crate::service::events::EventBus;
use crate::AppState;

/// Query parameters for the aggregated stream
#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub project: Option<String>,
    pub topics: Option<String>,
}

/// Multiplex the requested topics onto one SSE connection.
///
/// Topic membership is fixed when the connection opens.
pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (topics, rejected) = parse_topics(query.topics.as_deref().unwrap_or_default());
    for raw in &rejected {
        warn!("Ignoring unrecognized topic {:?}", raw);
    }

    let mut sources: Vec<BoxStream<'static, TopicEvent>> = Vec::new();
    let mut active = Vec::new();

    for topic in topics {
        let name = topic.name();
        match &topic {
            Topic::Tickets | Topic::Progress => {
                let Some(project) = query.project.as_deref() else {
                    warn!("Ignoring topic {}: no project given", name);
                    continue;
                };
                sources.push(
                    state
                        .event_bus
                        .subscribe(&EventBus::project_key(&name, project))
                        .filter_map(|received| {
                            future::ready(match received {
                                Ok(event) => Some(event),
                                Err(e) => {
                                    debug!("Event subscriber lagged: {}", e);
                                    None
                                }
                            })
                        })
                        .boxed(),
                );
            }
            Topic::Process(id) => match state.process_service.subscribe(id) {
                Ok(subscription) => {
                    let topic_name = name.clone();
                    sources.push(
                        subscription
                            .map(move |event| process_topic_event(&topic_name, event))
                            .boxed(),
                    );
                }
                Err(e) => {
                    warn!("Ignoring topic {}: {}", name, e);
                    continue;
                }
            },
        }
        active.push(name);
    }

    info!("Event stream opened with topics {:?}", active);

    let connected = TopicEvent::new(
        SYSTEM_TOPIC,
        "connected",
        serde_json::json!({
            "timestamp": Utc::now().timestamp_millis(),
            "topics": active,
        }),
    );

    // Stay open after every source finishes; only the client ends the stream
    let stream = stream::once(async move { connected })
        .chain(stream::select_all(sources))
        .chain(stream::pending())
        .map(|event| {
            Ok(Event::default()
                .json_data(&event)
                .unwrap_or_else(|e| Event::default().comment(format!("failed to encode event: {}", e))))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn process_topic_event(topic: &str, event: ProcessEvent) -> TopicEvent {
    match event {
        ProcessEvent::Output(line) => TopicEvent::new(
            topic,
            "output",
            serde_json::to_value(line).unwrap_or(serde_json::Value::Null),
        ),
        ProcessEvent::Lagged => TopicEvent::new(topic, "lagged", serde_json::json!({})),
        ProcessEvent::Exit { code } => {
            TopicEvent::new(topic, "exit", serde_json::json!({ "code": code }))
        }
    }
}
