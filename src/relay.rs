//! The synchronous core of one session.
//!
//! A `Relay` owns the two per-direction framers and a handle on the shared
//! rule set. Each pump call takes raw bytes off one channel and produces the
//! byte batches that must go to the opposite channel and to the capture
//! sinks. All the framing, rewriting and auto-response logic lives here so
//! the surrounding task only does channel I/O.

use std::sync::Arc;

use crate::framer::{Framer, FramingMode};
use crate::rules::{Action, Direction, RuleSet};

/// Byte batches produced by pumping one read's worth of input.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Traffic {
    /// Framed bytes for the upstream server channel.
    pub to_server: Vec<u8>,
    /// Framed bytes for the inbound client channel.
    pub to_client: Vec<u8>,
    /// Framed server-to-client bytes for the server capture sink.
    pub server_capture: Vec<u8>,
    /// Framed client-to-server bytes for the client capture sink.
    pub client_capture: Vec<u8>,
}

pub struct Relay {
    rules: Arc<RuleSet>,
    client: Framer,
    server: Framer,
}

impl Relay {
    pub fn new(rules: Arc<RuleSet>) -> Relay {
        Relay { rules, client: Framer::new(), server: Framer::new() }
    }

    /// Feed bytes received from the NETCONF client.
    pub fn pump_client(&mut self, bytes: &[u8]) -> Traffic {
        let mut traffic = Traffic::default();
        let feed = self.client.feed(bytes);
        if let Some(err) = feed.error {
            log::error!("client framing error: {}", err);
        }
        for msg in feed.messages {
            match self.rules.apply(Direction::ClientToServer, msg) {
                Action::Forward(body) => {
                    let framed = self.client.encode(&body);
                    traffic.to_server.extend_from_slice(&framed);
                    traffic.client_capture.extend_from_slice(&framed);
                }
                Action::Absorb { message, response } => {
                    log::info!("auto-response to NETCONF client message");
                    // the absorbed message is still captured, just never
                    // forwarded upstream
                    let framed = self.client.encode(&message);
                    traffic.client_capture.extend_from_slice(&framed);
                    // inject the canned reply through the normal
                    // server-to-client pipeline so it picks up the server
                    // message modifiers like a real response would. The
                    // injection must parse on that leg, so it is framed in
                    // the server direction's pinned mode; only while that
                    // leg is still unclassified does the client's mode
                    // stand in (and thereby pin it)
                    let injected = if self.server.mode() == FramingMode::Unknown {
                        self.client.encode(&response)
                    } else {
                        self.server.encode(&response)
                    };
                    self.route_server(&injected, &mut traffic);
                }
            }
        }
        traffic
    }

    /// Feed bytes received from the NETCONF server.
    pub fn pump_server(&mut self, bytes: &[u8]) -> Traffic {
        let mut traffic = Traffic::default();
        self.route_server(bytes, &mut traffic);
        traffic
    }

    fn route_server(&mut self, bytes: &[u8], traffic: &mut Traffic) {
        let feed = self.server.feed(bytes);
        if let Some(err) = feed.error {
            log::error!("server framing error: {}", err);
        }
        for msg in feed.messages {
            // auto-responses are never consulted on this direction
            if let Action::Forward(body) = self.rules.apply(Direction::ServerToClient, msg) {
                let framed = self.server.encode(&body);
                traffic.to_client.extend_from_slice(&framed);
                traffic.server_capture.extend_from_slice(&framed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn ruleset(json: &str) -> Arc<RuleSet> {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        Arc::new(RuleSet::load(file.path()).unwrap())
    }

    #[test]
    fn passthrough_both_directions() {
        let mut relay = Relay::new(Arc::new(RuleSet::empty()));

        let traffic = relay.pump_client(b"<hello/>]]>]]>");
        assert_eq!(traffic.to_server, b"<hello/>]]>]]>");
        assert_eq!(traffic.client_capture, b"<hello/>]]>]]>");
        assert!(traffic.to_client.is_empty());
        assert!(traffic.server_capture.is_empty());

        let traffic = relay.pump_server(b"<hello/>]]>]]>");
        assert_eq!(traffic.to_client, b"<hello/>]]>]]>");
        assert_eq!(traffic.server_capture, b"<hello/>]]>]]>");
        assert!(traffic.to_server.is_empty());
        assert!(traffic.client_capture.is_empty());
    }

    #[test]
    fn partial_reads_produce_no_traffic() {
        let mut relay = Relay::new(Arc::new(RuleSet::empty()));
        assert_eq!(relay.pump_server(b"<hel"), Traffic::default());
        assert_eq!(relay.pump_server(b"lo/>]]>]]"), Traffic::default());
        let traffic = relay.pump_server(b">");
        assert_eq!(traffic.to_client, b"<hello/>]]>]]>");
    }

    #[test]
    fn server_rewrite_reaches_client_and_capture() {
        let rules = ruleset(r#"{"server-msg-modifier": [{"match": "foo", "patch": "bar"}]}"#);
        let mut relay = Relay::new(rules);
        let traffic = relay.pump_server(b"<x>foo foo</x>]]>]]>");
        assert_eq!(traffic.to_client, b"<x>bar bar</x>]]>]]>");
        assert_eq!(traffic.server_capture, b"<x>bar bar</x>]]>]]>");
    }

    #[test]
    fn absorb_sends_nothing_upstream() {
        let rules = ruleset(
            r#"{"auto-respond": [{"match": "^<rpc>.*<get/>.*</rpc>$", "response": "<rpc-reply/>"}]}"#,
        );
        let mut relay = Relay::new(rules);
        let traffic = relay.pump_client(b"<rpc> <get/> </rpc>]]>]]>");
        assert!(traffic.to_server.is_empty());
        // the original message shows up on the client capture, the canned
        // reply goes to the client and the server capture
        assert_eq!(traffic.client_capture, b"<rpc> <get/> </rpc>]]>]]>");
        assert_eq!(traffic.to_client, b"<rpc-reply/>]]>]]>");
        assert_eq!(traffic.server_capture, b"<rpc-reply/>]]>]]>");
    }

    #[test]
    fn absorbed_response_is_framed_in_chunked_mode() {
        let rules = ruleset(
            r#"{"auto-respond": [{"match": "^<get/>$", "response": "<rpc-reply/>"}]}"#,
        );
        let mut relay = Relay::new(rules);
        let traffic = relay.pump_client(b"\n#6\n<get/>\n##\n");
        assert!(traffic.to_server.is_empty());
        assert_eq!(traffic.to_client, b"\n#12\n<rpc-reply/>\n##\n");
        assert_eq!(traffic.client_capture, b"\n#6\n<get/>\n##\n");
    }

    #[test]
    fn absorbed_response_follows_the_server_mode_when_pinned() {
        let rules = ruleset(
            r#"{"auto-respond": [{
                "match": "^<rpc><kill-session/></rpc>$",
                "response": "<rpc-reply><ok/></rpc-reply>"
            }]}"#,
        );
        let mut relay = Relay::new(rules);
        // the server hello pins that leg to end-of-message framing
        let traffic = relay.pump_server(b"<hello/>]]>]]>");
        assert_eq!(traffic.to_client, b"<hello/>]]>]]>");
        // the client leg talks chunked framing; the injected reply must
        // still parse on the server leg, so it comes back EOM-framed
        let traffic = relay.pump_client(b"\n#26\n<rpc><kill-session/></rpc>\n##\n");
        assert!(traffic.to_server.is_empty());
        assert_eq!(traffic.to_client, b"<rpc-reply><ok/></rpc-reply>]]>]]>");
        assert_eq!(traffic.server_capture, b"<rpc-reply><ok/></rpc-reply>]]>]]>");
        assert_eq!(traffic.client_capture, b"\n#26\n<rpc><kill-session/></rpc>\n##\n");
        // the server leg's buffer is clean for the next real response
        let traffic = relay.pump_server(b"<rpc-reply><data/></rpc-reply>]]>]]>");
        assert_eq!(traffic.to_client, b"<rpc-reply><data/></rpc-reply>]]>]]>");
    }

    #[test]
    fn synthesized_responses_see_server_rewrites() {
        let rules = ruleset(
            r#"{
                "server-msg-modifier": [{"match": "reply", "patch": "patched-reply"}],
                "auto-respond": [{"match": "^<get/>$", "response": "<reply/>"}]
            }"#,
        );
        let mut relay = Relay::new(rules);
        let traffic = relay.pump_client(b"<get/>]]>]]>");
        assert_eq!(traffic.to_client, b"<patched-reply/>]]>]]>");
    }

    #[test]
    fn server_message_matching_an_auto_response_is_forwarded() {
        let rules = ruleset(
            r#"{"auto-respond": [{"match": "^<get/>$", "response": "<rpc-reply/>"}]}"#,
        );
        let mut relay = Relay::new(rules);
        let traffic = relay.pump_server(b"<get/>]]>]]>");
        assert_eq!(traffic.to_client, b"<get/>]]>]]>");
        assert!(traffic.to_server.is_empty());
    }

    #[test]
    fn directions_keep_independent_framing_modes() {
        let mut relay = Relay::new(Arc::new(RuleSet::empty()));
        let traffic = relay.pump_server(b"<hello/>]]>]]>");
        assert_eq!(traffic.to_client, b"<hello/>]]>]]>");
        let traffic = relay.pump_client(b"\n#6\n<rpc/>\n##\n");
        assert_eq!(traffic.to_server, b"\n#6\n<rpc/>\n##\n");
    }

    #[test]
    fn message_order_is_preserved_within_a_direction() {
        let mut relay = Relay::new(Arc::new(RuleSet::empty()));
        let traffic = relay.pump_client(b"<a/>]]>]]><b/>]]>]]><c/>]]>]]>");
        assert_eq!(traffic.to_server, b"<a/>]]>]]><b/>]]>]]><c/>]]>]]>");
    }

    #[test]
    fn framing_error_discards_buffer_and_session_recovers() {
        let mut relay = Relay::new(Arc::new(RuleSet::empty()));
        relay.pump_client(b"\n#3\nabc\n##\n");
        let traffic = relay.pump_client(b"junk here");
        assert_eq!(traffic, Traffic::default());
        // the direction resynchronizes on the next well-formed bytes
        let traffic = relay.pump_client(b"\n#4\n<x/>\n##\n");
        assert_eq!(traffic.to_server, b"\n#4\n<x/>\n##\n");
    }
}
