//! Message patching rules.
//!
//! A `RuleSet` is loaded once at startup from a JSON rule file and shared
//! read-only by every session. It knows how to rewrite message bodies per
//! direction and how to short-circuit whole client RPCs with a canned
//! response. Messages are treated as opaque bytes throughout; patterns run in
//! dot-matches-all mode so multi-line XML matches naturally.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context};
use regex::bytes::{Regex, RegexBuilder};
use serde_derive::Deserialize;

/// Which way a message is travelling through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// What the rule engine decided to do with one message.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    /// Pass the (possibly rewritten) body on to the other side.
    Forward(Vec<u8>),
    /// Do not forward `message`; inject `response` as if the server had
    /// produced it. Only ever returned for client-to-server messages.
    Absorb { message: Vec<u8>, response: Vec<u8> },
}

struct Rewrite {
    pattern: Regex,
    template: Vec<u8>,
}

struct AutoResponse {
    pattern: Regex,
    template: Vec<u8>,
}

pub struct RuleSet {
    server_rewrites: Vec<Rewrite>,
    client_rewrites: Vec<Rewrite>,
    auto_responses: Vec<AutoResponse>,
}

/// On-disk shape of the rule file. Unknown keys are ignored on purpose so
/// rule files can carry comments-by-convention fields.
#[derive(Deserialize)]
struct RuleFile {
    #[serde(rename = "server-msg-modifier", default)]
    server_msg_modifier: Vec<RawRule>,
    #[serde(rename = "client-msg-modifier", default)]
    client_msg_modifier: Vec<RawRule>,
    #[serde(rename = "auto-respond", default)]
    auto_respond: Vec<RawRule>,
}

#[derive(Deserialize)]
struct RawRule {
    #[serde(rename = "match")]
    pattern: String,
    patch: Option<String>,
    #[serde(rename = "patch-file")]
    patch_file: Option<String>,
    response: Option<String>,
    #[serde(rename = "response-file")]
    response_file: Option<String>,
}

impl RuleSet {
    /// A rule set that forwards everything untouched.
    pub fn empty() -> RuleSet {
        RuleSet { server_rewrites: Vec::new(), client_rewrites: Vec::new(), auto_responses: Vec::new() }
    }

    /// Load and compile a rule file. Any unparseable entry is fatal: rules
    /// that silently do nothing are worse than refusing to start.
    pub fn load(path: &Path) -> anyhow::Result<RuleSet> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading rule file {}", path.display()))?;
        let file: RuleFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing rule file {}", path.display()))?;

        Ok(RuleSet {
            server_rewrites: file
                .server_msg_modifier
                .into_iter()
                .map(Rewrite::compile)
                .collect::<anyhow::Result<_>>()?,
            client_rewrites: file
                .client_msg_modifier
                .into_iter()
                .map(Rewrite::compile)
                .collect::<anyhow::Result<_>>()?,
            auto_responses: file
                .auto_respond
                .into_iter()
                .map(AutoResponse::compile)
                .collect::<anyhow::Result<_>>()?,
        })
    }

    /// Run one complete message through the rules for its direction.
    pub fn apply(&self, direction: Direction, msg: Vec<u8>) -> Action {
        match direction {
            Direction::ServerToClient => Action::Forward(rewrite(&self.server_rewrites, msg)),
            Direction::ClientToServer => {
                let body = rewrite(&self.client_rewrites, msg);
                match self.auto_response(&body) {
                    Some(response) => Action::Absorb { message: body, response },
                    None => Action::Forward(body),
                }
            }
        }
    }

    // The first auto-respond rule that matches at the very start of the
    // message wins. Rewrites substitute every occurrence; an auto-response
    // only fires when it anchors the message head, since it stands in for a
    // whole RPC.
    fn auto_response(&self, msg: &[u8]) -> Option<Vec<u8>> {
        for rule in &self.auto_responses {
            if let Some(m) = rule.pattern.find(msg) {
                if m.start() == 0 {
                    return Some(rule.pattern.replace_all(msg, rule.template.as_slice()).into_owned());
                }
            }
        }
        None
    }
}

impl Rewrite {
    fn compile(raw: RawRule) -> anyhow::Result<Rewrite> {
        let template = match (raw.patch_file, raw.patch) {
            (Some(path), _) => {
                fs::read(&path).with_context(|| format!("reading patch file {}", path))?
            }
            (None, Some(inline)) => inline.into_bytes(),
            (None, None) => {
                bail!("modifier rule '{}' has neither patch nor patch-file", raw.pattern)
            }
        };
        Ok(Rewrite { pattern: compile_pattern(&raw.pattern)?, template })
    }
}

impl AutoResponse {
    fn compile(raw: RawRule) -> anyhow::Result<AutoResponse> {
        let template = match (raw.response_file, raw.response) {
            (Some(path), _) => {
                fs::read(&path).with_context(|| format!("reading response file {}", path))?
            }
            (None, Some(inline)) => inline.into_bytes(),
            (None, None) => {
                bail!("auto-respond rule '{}' has neither response nor response-file", raw.pattern)
            }
        };
        Ok(AutoResponse { pattern: compile_pattern(&raw.pattern)?, template })
    }
}

fn compile_pattern(src: &str) -> anyhow::Result<Regex> {
    RegexBuilder::new(src)
        .dot_matches_new_line(true)
        .build()
        .with_context(|| format!("compiling pattern '{}'", src))
}

fn rewrite(rules: &[Rewrite], msg: Vec<u8>) -> Vec<u8> {
    let mut body = msg;
    for rule in rules {
        let next = rule.pattern.replace_all(&body, rule.template.as_slice()).into_owned();
        body = next;
    }
    body
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn ruleset(json: &str) -> anyhow::Result<RuleSet> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(json.as_bytes())?;
        RuleSet::load(file.path())
    }

    fn forward(action: Action) -> Vec<u8> {
        match action {
            Action::Forward(body) => body,
            Action::Absorb { .. } => panic!("expected a forward"),
        }
    }

    #[test]
    fn rewrite_replaces_every_occurrence() {
        let rules = ruleset(
            r#"{"server-msg-modifier": [{"match": "foo", "patch": "bar"}]}"#,
        )
        .unwrap();
        let out = forward(rules.apply(Direction::ServerToClient, b"<x>foo foo</x>".to_vec()));
        assert_eq!(out, b"<x>bar bar</x>");
    }

    #[test]
    fn rewrites_apply_in_listed_order() {
        let rules = ruleset(
            r#"{"client-msg-modifier": [
                {"match": "a", "patch": "b"},
                {"match": "bb", "patch": "c"}
            ]}"#,
        )
        .unwrap();
        let out = forward(rules.apply(Direction::ClientToServer, b"ab".to_vec()));
        assert_eq!(out, b"c");
    }

    #[test]
    fn rewrite_templates_expand_backreferences() {
        let rules = ruleset(
            r#"{"server-msg-modifier": [
                {"match": "<user>(\\w+)</user>", "patch": "<user>proxy-$1</user>"}
            ]}"#,
        )
        .unwrap();
        let out =
            forward(rules.apply(Direction::ServerToClient, b"<user>admin</user>".to_vec()));
        assert_eq!(out, b"<user>proxy-admin</user>");
    }

    #[test]
    fn patterns_match_across_newlines() {
        let rules = ruleset(
            r#"{"server-msg-modifier": [{"match": "<a>.*</a>", "patch": "<a/>"}]}"#,
        )
        .unwrap();
        let out =
            forward(rules.apply(Direction::ServerToClient, b"<a>one\ntwo</a>".to_vec()));
        assert_eq!(out, b"<a/>");
    }

    #[test]
    fn rewrite_is_idempotent_when_replacement_does_not_match() {
        let rules = ruleset(
            r#"{"server-msg-modifier": [{"match": "foo", "patch": "bar"}]}"#,
        )
        .unwrap();
        let once = forward(rules.apply(Direction::ServerToClient, b"a foo b".to_vec()));
        let twice = forward(rules.apply(Direction::ServerToClient, once.clone()));
        assert_eq!(once, twice);
    }

    #[test]
    fn auto_response_fires_only_at_message_start() {
        let rules = ruleset(
            r#"{"auto-respond": [{"match": "<get/>", "response": "<rpc-reply/>"}]}"#,
        )
        .unwrap();
        match rules.apply(Direction::ClientToServer, b"<get/>".to_vec()) {
            Action::Absorb { message, response } => {
                assert_eq!(message, b"<get/>");
                assert_eq!(response, b"<rpc-reply/>");
            }
            Action::Forward(_) => panic!("expected an absorb"),
        }
        // an interior match does not absorb
        let out = forward(rules.apply(Direction::ClientToServer, b"<rpc><get/></rpc>".to_vec()));
        assert_eq!(out, b"<rpc><get/></rpc>");
    }

    #[test]
    fn auto_response_expands_backreferences_from_the_match() {
        let rules = ruleset(
            r#"{"auto-respond": [{
                "match": "^<rpc message-id=\"(\\d+)\">.*</rpc>$",
                "response": "<rpc-reply message-id=\"$1\"><ok/></rpc-reply>"
            }]}"#,
        )
        .unwrap();
        match rules.apply(
            Direction::ClientToServer,
            b"<rpc message-id=\"42\"><get/></rpc>".to_vec(),
        ) {
            Action::Absorb { response, .. } => {
                assert_eq!(response, b"<rpc-reply message-id=\"42\"><ok/></rpc-reply>");
            }
            Action::Forward(_) => panic!("expected an absorb"),
        }
    }

    #[test]
    fn first_matching_auto_response_wins() {
        let rules = ruleset(
            r#"{"auto-respond": [
                {"match": "^<rpc>", "response": "first"},
                {"match": "^<rpc><get/>", "response": "second"}
            ]}"#,
        )
        .unwrap();
        match rules.apply(Direction::ClientToServer, b"<rpc><get/></rpc>".to_vec()) {
            Action::Absorb { response, .. } => assert_eq!(response, b"first"),
            Action::Forward(_) => panic!("expected an absorb"),
        }
    }

    #[test]
    fn auto_responses_never_touch_server_messages() {
        let rules = ruleset(
            r#"{"auto-respond": [{"match": "^<rpc>.*</rpc>$", "response": "<rpc-reply/>"}]}"#,
        )
        .unwrap();
        let out = forward(rules.apply(Direction::ServerToClient, b"<rpc><get/></rpc>".to_vec()));
        assert_eq!(out, b"<rpc><get/></rpc>");
    }

    #[test]
    fn client_rewrites_run_before_auto_response_matching() {
        let rules = ruleset(
            r#"{
                "client-msg-modifier": [{"match": "get-config", "patch": "get"}],
                "auto-respond": [{"match": "^<get/>$", "response": "<rpc-reply/>"}]
            }"#,
        )
        .unwrap();
        match rules.apply(Direction::ClientToServer, b"<get-config/>".to_vec()) {
            Action::Absorb { message, .. } => assert_eq!(message, b"<get/>"),
            Action::Forward(_) => panic!("expected an absorb"),
        }
    }

    #[test]
    fn templates_can_come_from_files() {
        let mut patch = tempfile::NamedTempFile::new().unwrap();
        patch.write_all(b"<replaced/>").unwrap();
        let rules = ruleset(&format!(
            r#"{{"server-msg-modifier": [{{"match": "<orig/>", "patch-file": "{}"}}]}}"#,
            patch.path().display(),
        ))
        .unwrap();
        let out = forward(rules.apply(Direction::ServerToClient, b"<orig/>".to_vec()));
        assert_eq!(out, b"<replaced/>");
    }

    #[test]
    fn missing_match_is_fatal() {
        assert!(ruleset(r#"{"auto-respond": [{"response": "<rpc-reply/>"}]}"#).is_err());
    }

    #[test]
    fn bad_pattern_is_fatal() {
        assert!(ruleset(r#"{"client-msg-modifier": [{"match": "(", "patch": "x"}]}"#).is_err());
    }

    #[test]
    fn modifier_without_patch_is_fatal() {
        assert!(ruleset(r#"{"client-msg-modifier": [{"match": "x"}]}"#).is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let rules = ruleset(
            r#"{
                "comment": "top-level note",
                "server-msg-modifier": [{"match": "a", "patch": "b", "note": "entry note"}]
            }"#,
        )
        .unwrap();
        let out = forward(rules.apply(Direction::ServerToClient, b"a".to_vec()));
        assert_eq!(out, b"b");
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let rules = ruleset("{}").unwrap();
        let out = forward(rules.apply(Direction::ClientToServer, b"<rpc/>".to_vec()));
        assert_eq!(out, b"<rpc/>");
    }
}
