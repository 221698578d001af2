//! The relay connection pool.
//!
//! One pool per endpoint: a websocket connection per configured relay, with
//! automatic reconnection.  Subscriptions are replayed after every
//! (re)connect; published events are fanned out to all relays.  Inbound
//! events are verified, deduplicated across relays and handed to the
//! endpoint through a single channel, preserving network arrival order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use nostr::{Event, JsonUtil};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use url::Url;

/// How long to wait before re-dialing a dropped relay.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How many event ids the cross-relay duplicate filter remembers.
const SEEN_CAP: usize = 4096;

//----------- RelayPool --------------------------------------------------------

/// A pool of relay connections serving one endpoint.
#[derive(Debug)]
pub struct RelayPool {
    /// Per-relay outbound frame senders.
    outbound: Mutex<Vec<mpsc::UnboundedSender<String>>>,

    /// Active subscriptions, replayed after every reconnect.
    subscriptions: Mutex<HashMap<String, Value>>,

    /// Where verified, deduplicated inbound events go.
    event_tx: mpsc::UnboundedSender<Event>,

    /// The cross-relay duplicate filter.
    seen: Mutex<SeenCache>,
}

impl RelayPool {
    /// Create a pool and spawn a connection task per relay.
    pub fn spawn(relays: &[Url], event_tx: mpsc::UnboundedSender<Event>) -> Arc<Self> {
        let pool = Arc::new(Self {
            outbound: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            event_tx,
            seen: Mutex::new(SeenCache::new(SEEN_CAP)),
        });

        for url in relays {
            let (tx, rx) = mpsc::unbounded_channel();
            pool.outbound.lock().unwrap().push(tx);
            tokio::spawn(relay_task(pool.clone(), url.clone(), rx));
        }

        pool
    }

    /// Open (or replace) a subscription on every relay.
    pub fn subscribe(&self, id: &str, filter: Value) {
        let frame = req_frame(id, &filter);
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id.to_string(), filter);
        self.broadcast(&frame);
    }

    /// Close a subscription on every relay.
    pub fn unsubscribe(&self, id: &str) {
        self.subscriptions.lock().unwrap().remove(id);
        self.broadcast(&json!(["CLOSE", id]).to_string());
    }

    /// Publish an event to every relay.
    pub fn publish(&self, event: &Event) {
        self.broadcast(&event_frame(event));
    }

    fn broadcast(&self, frame: &str) {
        for tx in self.outbound.lock().unwrap().iter() {
            let _ = tx.send(frame.to_string());
        }
    }

    /// All frames needed to restore the current subscriptions.
    fn replay_frames(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .map(|(id, filter)| req_frame(id, filter))
            .collect()
    }

    /// Handle one inbound frame from a relay.
    fn handle_frame(&self, relay: &Url, text: &str) {
        match parse_frame(text) {
            Some(IncomingFrame::Event(event)) => {
                if event.verify().is_err() {
                    warn!("Dropping event with a bad signature from '{relay}'");
                    return;
                }
                if !self.seen.lock().unwrap().insert(event.id.to_hex()) {
                    trace!("Dropping duplicate event {} from '{relay}'", event.id);
                    return;
                }
                let _ = self.event_tx.send(event);
            }
            Some(IncomingFrame::Notice(message)) => {
                debug!("Notice from '{relay}': {message}");
            }
            Some(IncomingFrame::Other) => {}
            None => {
                trace!("Unparseable frame from '{relay}'");
            }
        }
    }
}

/// One relay connection: dial, replay subscriptions, pump frames, redial.
async fn relay_task(
    pool: Arc<RelayPool>,
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    loop {
        let stream = match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                debug!("Connected to relay '{url}'");
                stream
            }
            Err(err) => {
                debug!("Cannot connect to relay '{url}': {err}");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        let (mut sink, mut source) = stream.split();

        // Restore the subscriptions on the fresh connection.
        let mut healthy = true;
        for frame in pool.replay_frames() {
            if sink.send(Message::text(frame)).await.is_err() {
                healthy = false;
                break;
            }
        }

        while healthy {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        // The owning endpoint is gone.
                        return;
                    };
                    if sink.send(Message::text(frame)).await.is_err() {
                        break;
                    }
                }
                message = source.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            pool.handle_frame(&url, text.as_str());
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        debug!("Lost connection to relay '{url}'; retrying");
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

//----------- Frames -----------------------------------------------------------

/// An inbound frame we care about.
enum IncomingFrame {
    Event(Event),
    Notice(String),
    Other,
}

fn req_frame(id: &str, filter: &Value) -> String {
    json!(["REQ", id, filter]).to_string()
}

fn event_frame(event: &Event) -> String {
    format!(r#"["EVENT",{}]"#, event.as_json())
}

fn parse_frame(text: &str) -> Option<IncomingFrame> {
    let value: Value = serde_json::from_str(text).ok()?;
    let frame = value.as_array()?;
    match frame.first()?.as_str()? {
        "EVENT" => {
            let event = Event::from_json(frame.get(2)?.to_string()).ok()?;
            Some(IncomingFrame::Event(event))
        }
        "NOTICE" => Some(IncomingFrame::Notice(
            frame.get(1)?.as_str().unwrap_or_default().to_string(),
        )),
        // OK, EOSE, CLOSED, AUTH and friends need no handling here.
        _ => Some(IncomingFrame::Other),
    }
}

//----------- SeenCache --------------------------------------------------------

/// A bounded set of recently seen event ids.
#[derive(Debug)]
struct SeenCache {
    set: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl SeenCache {
    fn new(cap: usize) -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Record an id; returns `false` if it was already known.
    fn insert(&mut self, id: String) -> bool {
        if !self.set.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys, Kind};

    use super::*;

    #[test]
    fn seen_cache_dedupes_and_evicts() {
        let mut cache = SeenCache::new(2);
        assert!(cache.insert("a".into()));
        assert!(!cache.insert("a".into()));
        assert!(cache.insert("b".into()));
        assert!(cache.insert("c".into()));
        // "a" was evicted and is fresh again.
        assert!(cache.insert("a".into()));
    }

    #[test]
    fn frame_round_trip() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::TextNote, "hello")
            .sign_with_keys(&keys)
            .unwrap();

        let frame = format!(r#"["EVENT","sub-1",{}]"#, event.as_json());
        match parse_frame(&frame) {
            Some(IncomingFrame::Event(parsed)) => assert_eq!(parsed.id, event.id),
            _ => panic!("expected an event frame"),
        }

        assert!(matches!(
            parse_frame(r#"["NOTICE","slow down"]"#),
            Some(IncomingFrame::Notice(m)) if m == "slow down"
        ));
        assert!(matches!(
            parse_frame(r#"["EOSE","sub-1"]"#),
            Some(IncomingFrame::Other)
        ));
        assert!(parse_frame("garbage").is_none());
    }

    #[test]
    fn req_frame_shape() {
        let frame = req_frame("sub-1", &json!({"kinds": [24133]}));
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value[0], "REQ");
        assert_eq!(value[1], "sub-1");
        assert_eq!(value[2]["kinds"][0], 24133);
    }
}
