//! Chat adapter: one JSON message list in, one assistant reply out.
//!
//! The backend sees the system prompt and the last user message. Earlier
//! turns are only replayed when `llm.forward_history` is set.

use crate::config::{EnvLookup, LlmConfig, RelayConfig};
use crate::doctor;
use crate::error::AdapterError;
use crate::output::{self, Exit};
use async_trait::async_trait;
use clap::Parser;
use clap::error::ErrorKind;
use relay_llm::{ChatMessage, LlmClient, Role};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

pub const NO_MESSAGES: &str = "No messages provided";
const PROCESSING_PREFIX: &str = "Chat processing error: ";

#[derive(Debug, Parser)]
#[command(
    name = "relay-chat",
    version,
    about = "Relay one chat turn to the LLM gateway"
)]
pub struct ChatCli {
    /// JSON array of {role, content} messages. `@<path>` reads a file, `-` reads stdin.
    pub messages: Option<String>,
    /// TOML config file (default: $RELAY_CONFIG).
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Print the resolved configuration and exit.
    #[arg(long)]
    pub doctor: bool,
}

#[derive(Debug, Deserialize)]
struct InputMessage {
    role: String,
    /// Tool calls and the like carry no content, or `null`.
    #[serde(default)]
    content: Option<serde_json::Value>,
}

impl InputMessage {
    fn text(self) -> Option<String> {
        match self.content {
            Some(serde_json::Value::String(text)) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub response: String,
}

/// What actually gets sent for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub system_prompt: String,
    pub user_text: String,
    /// User/assistant messages preceding the last user message.
    pub history: Vec<ChatMessage>,
}

impl ChatTurn {
    pub fn from_messages(messages: &[ChatMessage], default_system_prompt: &str) -> Self {
        let system_prompt = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .filter(|c| !c.is_empty())
            .unwrap_or(default_system_prompt)
            .to_string();

        let last_user = messages.iter().rposition(|m| m.role == Role::User);
        let user_text = last_user
            .map(|idx| messages[idx].content.clone())
            .unwrap_or_default();
        let preceding = match last_user {
            Some(idx) => &messages[..idx],
            None => messages,
        };
        let history = preceding
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        Self {
            system_prompt,
            user_text,
            history,
        }
    }

    pub fn to_request(&self, forward_history: bool) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.history.len() + 2);
        out.push(ChatMessage::system(self.system_prompt.clone()));
        if forward_history {
            out.extend(self.history.iter().cloned());
        }
        out.push(ChatMessage::user(self.user_text.clone()));
        out
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        session_id: &str,
    ) -> Result<String, AdapterError>;
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        session_id: &str,
    ) -> Result<String, AdapterError> {
        let resp = self.chat(messages, session_id).await?;
        Ok(resp.message.content)
    }
}

pub fn connect_gateway(cfg: &RelayConfig, api_key: &str) -> Box<dyn ChatBackend> {
    Box::new(
        LlmClient::new(api_key, cfg.provider(), &cfg.llm.model)
            .with_base_url(&cfg.llm.base_url)
            .with_timeout(cfg.timeout()),
    )
}

pub fn parse_messages(raw: &str) -> Result<Vec<ChatMessage>, AdapterError> {
    let input: Vec<InputMessage> =
        serde_json::from_str(raw).map_err(|e| AdapterError::ParseFailure(e.to_string()))?;
    let mut out = Vec::with_capacity(input.len());
    for (idx, m) in input.into_iter().enumerate() {
        let role = match m.role.as_str() {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                tracing::debug!(role = %other, "skipping message with unknown role");
                continue;
            }
        };
        match (role, m.text()) {
            (Role::System, Some(text)) => out.push(ChatMessage::system(text)),
            (Role::User, Some(text)) => out.push(ChatMessage::user(text)),
            (Role::Assistant, Some(text)) => out.push(ChatMessage::assistant(text)),
            (Role::Assistant, None) => {
                tracing::debug!(index = idx, "skipping assistant message without text");
            }
            (_, None) => {
                return Err(AdapterError::ParseFailure(format!(
                    "message {idx} ({}) has no string content",
                    role.as_str()
                )));
            }
        }
    }
    Ok(out)
}

pub fn new_session_id() -> String {
    format!("user_session_{}", Uuid::new_v4().simple())
}

pub async fn process_chat(
    backend: &dyn ChatBackend,
    raw_messages: &str,
    settings: &LlmConfig,
) -> Result<ChatReply, AdapterError> {
    let messages = parse_messages(raw_messages).map_err(|e| e.context(PROCESSING_PREFIX))?;
    let turn = ChatTurn::from_messages(&messages, &settings.default_system_prompt);
    let session_id = new_session_id();
    tracing::info!(
        session_id = %session_id,
        message_count = messages.len(),
        history_len = turn.history.len(),
        forward_history = settings.forward_history,
        "relaying chat turn"
    );

    let request = turn.to_request(settings.forward_history);
    let response = backend
        .complete(&request, &session_id)
        .await
        .map_err(|e| e.context(PROCESSING_PREFIX))?;
    Ok(ChatReply { response })
}

/// Resolves the positional argument to the JSON text.
async fn read_messages_arg<R: AsyncRead + Unpin>(
    arg: &str,
    mut stdin: R,
) -> Result<String, AdapterError> {
    if arg == "-" {
        let mut buf = String::new();
        stdin
            .read_to_string(&mut buf)
            .await
            .map_err(|e| AdapterError::InvalidInput(format!("read stdin: {e}")))?;
        return Ok(buf);
    }
    if let Some(path) = arg.strip_prefix('@') {
        return tokio::fs::read_to_string(path)
            .await
            .map_err(|e| AdapterError::InvalidInput(format!("read {path}: {e}")));
    }
    Ok(arg.to_string())
}

/// Runs one chat invocation. Always exits 0; failures are in the JSON line.
pub async fn run<I, T, R, F>(args: I, env: EnvLookup<'_>, stdin: R, connect: F) -> Exit
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    R: AsyncRead + Unpin,
    F: FnOnce(&RelayConfig, &str) -> Box<dyn ChatBackend>,
{
    let cli = match ChatCli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            return Exit::ok(e.render().to_string());
        }
        Err(e) => {
            let err = AdapterError::InvalidInput(
                e.kind().as_str().unwrap_or("invalid arguments").to_string(),
            );
            return Exit::failed(&err, 0);
        }
    };

    if cli.messages.is_none() && !cli.doctor {
        return Exit::failed(&AdapterError::InvalidInput(NO_MESSAGES.to_string()), 0);
    }

    let cfg = match RelayConfig::load(cli.config, env).await {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!(error = %e, "config load failed");
            let err = AdapterError::InvalidInput(format!("config error: {e:#}"));
            return Exit::failed(&err, 0);
        }
    };

    if cli.doctor {
        return Exit::ok(doctor::render(&cfg));
    }
    let Some(arg) = cli.messages else {
        return Exit::failed(&AdapterError::InvalidInput(NO_MESSAGES.to_string()), 0);
    };

    let api_key = match cfg.require_llm_key() {
        Ok(key) => key,
        Err(e) => {
            tracing::warn!(error = %e, "llm key missing");
            return Exit::failed(&e, 0);
        }
    };

    let raw = match read_messages_arg(&arg, stdin).await {
        Ok(raw) => raw,
        Err(e) => return Exit::failed(&e.context(PROCESSING_PREFIX), 0),
    };

    let backend = connect(&cfg, api_key);
    let result = process_chat(backend.as_ref(), &raw, &cfg.llm).await;
    if let Err(e) = &result {
        tracing::warn!(error_kind = e.kind(), error = %e, "chat relay failed");
    }
    Exit::ok(output::render(&result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_SYSTEM_PROMPT;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeBackend {
        calls: Arc<Mutex<Vec<(Vec<ChatMessage>, String)>>>,
        fail_with: Option<AdapterError>,
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            session_id: &str,
        ) -> Result<String, AdapterError> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((messages.to_vec(), session_id.to_string()));
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok("Estou aqui com você.".to_string()),
            }
        }
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn json_line(exit: &Exit) -> Value {
        serde_json::from_str(&exit.line).expect("result line is json")
    }

    #[test]
    fn default_persona_when_no_system_message() {
        let msgs = vec![ChatMessage::user("oi")];
        let turn = ChatTurn::from_messages(&msgs, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(turn.system_prompt, DEFAULT_SYSTEM_PROMPT);

        let empty_system = vec![ChatMessage::system(""), ChatMessage::user("oi")];
        let turn = ChatTurn::from_messages(&empty_system, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(turn.system_prompt, DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn first_system_message_wins() {
        let msgs = vec![
            ChatMessage::system("coach"),
            ChatMessage::system("Contexto da personalidade: calmo"),
            ChatMessage::user("oi"),
        ];
        let turn = ChatTurn::from_messages(&msgs, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(turn.system_prompt, "coach");
    }

    #[test]
    fn missing_user_message_sends_empty_turn() {
        let msgs = vec![ChatMessage::system("coach"), ChatMessage::assistant("olá")];
        let turn = ChatTurn::from_messages(&msgs, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(turn.user_text, "");
        assert_eq!(turn.history, vec![ChatMessage::assistant("olá")]);
    }

    #[test]
    fn only_last_user_message_is_sent_by_default() {
        let msgs = vec![
            ChatMessage::user("primeira"),
            ChatMessage::assistant("resposta"),
            ChatMessage::user("segunda"),
        ];
        let turn = ChatTurn::from_messages(&msgs, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(turn.user_text, "segunda");

        let single = turn.to_request(false);
        assert_eq!(
            single,
            vec![
                ChatMessage::system(DEFAULT_SYSTEM_PROMPT),
                ChatMessage::user("segunda"),
            ]
        );

        let replayed = turn.to_request(true);
        assert_eq!(replayed.len(), 4);
        assert_eq!(replayed[1], ChatMessage::user("primeira"));
        assert_eq!(replayed[2], ChatMessage::assistant("resposta"));
        assert_eq!(replayed[3], ChatMessage::user("segunda"));
    }

    #[test]
    fn parse_messages_skips_unknown_roles_and_rejects_bad_json() {
        let msgs =
            parse_messages(r#"[{"role":"tool","content":"x"},{"role":"user","content":"oi"}]"#)
                .expect("parse");
        assert_eq!(msgs, vec![ChatMessage::user("oi")]);

        let err = parse_messages("not json").expect_err("bad json");
        assert_eq!(err.kind(), "parse_failure");
    }

    #[test]
    fn messages_without_text_content_are_tolerated_outside_system_and_user() {
        let msgs = parse_messages(r#"[{"role":"tool"},{"role":"user","content":"oi"}]"#)
            .expect("tool message without content");
        assert_eq!(msgs, vec![ChatMessage::user("oi")]);

        let msgs = parse_messages(
            r#"[{"role":"user","content":"a"},{"role":"assistant","content":null},{"role":"user","content":"b"}]"#,
        )
        .expect("assistant with null content");
        assert_eq!(msgs, vec![ChatMessage::user("a"), ChatMessage::user("b")]);

        let err = parse_messages(r#"[{"role":"user"}]"#).expect_err("user needs text");
        assert_eq!(err.kind(), "parse_failure");
        let err = parse_messages(r#"[{"role":"system","content":7}]"#).expect_err("system needs text");
        assert_eq!(err.kind(), "parse_failure");
    }

    #[tokio::test]
    async fn help_is_returned_instead_of_exiting() {
        let env = env_from(&[]);
        let exit = run(["relay-chat", "--help"], &env, &b""[..], |_, _| {
            panic!("help must not connect")
        })
        .await;
        assert_eq!(exit.code, 0);
        assert!(exit.line.contains("--doctor"));
    }

    #[test]
    fn session_ids_are_unique_and_prefixed() {
        let a = new_session_id();
        let b = new_session_id();
        assert!(a.starts_with("user_session_"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn process_chat_prefixes_failures() {
        let backend = FakeBackend::default();
        let err = process_chat(&backend, "{", &LlmConfig::default())
            .await
            .expect_err("bad json");
        assert!(err.to_string().starts_with("Chat processing error: "));
        assert!(backend.calls.lock().expect("calls lock").is_empty());

        let failing = FakeBackend {
            fail_with: Some(AdapterError::DownstreamFailure("http error: 502".to_string())),
            ..FakeBackend::default()
        };
        let err = process_chat(
            &failing,
            r#"[{"role":"user","content":"oi"}]"#,
            &LlmConfig::default(),
        )
        .await
        .expect_err("downstream");
        assert_eq!(err.to_string(), "Chat processing error: http error: 502");
        assert_eq!(err.kind(), "downstream_failure");
    }

    #[tokio::test]
    async fn run_without_messages_reports_and_exits_zero() {
        let env = env_from(&[("EMERGENT_LLM_KEY", "k")]);
        let exit = run(["relay-chat"], &env, &b""[..], |_, _| {
            Box::new(FakeBackend::default()) as Box<dyn ChatBackend>
        })
        .await;
        assert_eq!(exit.code, 0);
        let v = json_line(&exit);
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], NO_MESSAGES);
    }

    #[tokio::test]
    async fn run_without_key_reports_exact_error_and_never_connects() {
        let env = env_from(&[]);
        let mut connected = false;
        let exit = run(
            ["relay-chat", r#"[{"role":"user","content":"oi"}]"#],
            &env,
            &b""[..],
            |_, _| {
                connected = true;
                Box::new(FakeBackend::default()) as Box<dyn ChatBackend>
            },
        )
        .await;
        assert!(!connected);
        assert_eq!(exit.code, 0);
        let v = json_line(&exit);
        assert_eq!(v["success"], false);
        assert_eq!(v["error"], "EMERGENT_LLM_KEY not found");
        assert_eq!(v["error_kind"], "missing_credential");
    }

    #[tokio::test]
    async fn run_relays_turn_and_prints_response() {
        let env = env_from(&[("EMERGENT_LLM_KEY", "sk-emergent")]);
        let backend = FakeBackend::default();
        let seen_key = Arc::new(Mutex::new(String::new()));
        let seen = Arc::clone(&seen_key);
        let fake = backend.clone();
        let exit = run(
            [
                "relay-chat",
                r#"[{"role":"system","content":"coach"},{"role":"user","content":"oi"}]"#,
            ],
            &env,
            &b""[..],
            move |_, key| {
                *seen.lock().expect("key lock") = key.to_string();
                Box::new(fake) as Box<dyn ChatBackend>
            },
        )
        .await;

        assert_eq!(exit.code, 0);
        let v = json_line(&exit);
        assert_eq!(
            v,
            serde_json::json!({"success": true, "response": "Estou aqui com você."})
        );
        assert_eq!(*seen_key.lock().expect("key lock"), "sk-emergent");

        let calls = backend.calls.lock().expect("calls lock");
        assert_eq!(calls.len(), 1);
        let (messages, session_id) = &calls[0];
        assert_eq!(
            messages,
            &vec![ChatMessage::system("coach"), ChatMessage::user("oi")]
        );
        assert!(session_id.starts_with("user_session_"));
    }

    #[tokio::test]
    async fn run_reads_messages_from_stdin_and_files() {
        let env = env_from(&[("EMERGENT_LLM_KEY", "k")]);
        let stdin_body = br#"[{"role":"user","content":"via stdin"}]"#;
        let backend = FakeBackend::default();
        let fake = backend.clone();
        let exit = run(["relay-chat", "-"], &env, &stdin_body[..], move |_, _| {
            Box::new(fake) as Box<dyn ChatBackend>
        })
        .await;
        assert_eq!(json_line(&exit)["success"], true);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("messages.json");
        std::fs::write(&path, r#"[{"role":"user","content":"via file"}]"#).expect("write");
        let arg = format!("@{}", path.display());
        let fake = backend.clone();
        let exit = run(
            vec!["relay-chat".to_string(), arg],
            &env,
            &b""[..],
            move |_, _| Box::new(fake) as Box<dyn ChatBackend>,
        )
        .await;
        assert_eq!(json_line(&exit)["success"], true);

        let calls = backend.calls.lock().expect("calls lock");
        assert_eq!(calls[0].0[1], ChatMessage::user("via stdin"));
        assert_eq!(calls[1].0[1], ChatMessage::user("via file"));
    }

    #[tokio::test]
    async fn run_doctor_needs_no_messages_or_key() {
        let env = env_from(&[]);
        let exit = run(["relay-chat", "--doctor"], &env, &b""[..], |_, _| {
            Box::new(FakeBackend::default()) as Box<dyn ChatBackend>
        })
        .await;
        let v = json_line(&exit);
        assert_eq!(v["success"], true);
        assert_eq!(v["llm"]["key_present"], false);
    }
}
