use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{auth_state::slot::validate_part, domain::SessionId, errors::Error, Result};

const DEFAULT_TEMPORARY_FAILURE_REPLY: &str =
    "There was a temporary problem with the assistant. Please try again.";
const DEFAULT_MISSING_ASSISTANT_REPLY: &str = "Error: no assistant has been configured.";

/// Typed configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Storage
    pub mongo_url: String,
    pub mongo_db: String,
    pub mongo_collection: String,
    pub session_id: SessionId,

    // Assistant
    pub assistant_id: String,
    pub assistant_command: Option<PathBuf>,
    pub assistant_args: Vec<String>,
    pub assistant_timeout: Duration,

    // Queue
    pub handler_timeout: Option<Duration>,

    // Messaging
    pub groups_ignore: bool,
    pub outbound_min_interval: Duration,
    pub temporary_failure_reply: String,
    pub missing_assistant_reply: String,

    // Session lifecycle
    pub clear_session_on_logout: bool,

    // Bridge
    pub bridge_max_line_bytes: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let mongo_url = get("MONGO_URL").ok_or_else(|| {
            Error::Config("MONGO_URL environment variable is required".to_string())
        })?;
        let mongo_db = get("MONGO_DB").unwrap_or_else(|| "whatsapp".to_string());
        let mongo_collection = get("MONGO_COLLECTION").unwrap_or_else(|| "auth_states".to_string());

        let session_id = get("SESSION_ID").unwrap_or_else(|| SessionId::DEFAULT.to_string());
        validate_part(&session_id).map_err(|e| Error::Config(format!("SESSION_ID: {e}")))?;

        let assistant_id = get("ASSISTANT_ID")
            .or_else(|| get("OPENAI_ASSISTANT_ID"))
            .unwrap_or_default();
        let assistant_command = get("ASSISTANT_COMMAND").map(PathBuf::from);
        let assistant_args = parse_csv(get("ASSISTANT_ARGS"));
        let assistant_timeout =
            Duration::from_millis(parse_u64(get("ASSISTANT_TIMEOUT_MS")).unwrap_or(90_000));

        // 0 disables the timeout.
        let handler_timeout = match parse_u64(get("HANDLER_TIMEOUT_MS")).unwrap_or(120_000) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let groups_ignore = parse_bool(get("GROUPS_IGNORE")).unwrap_or(true);
        let outbound_min_interval =
            Duration::from_millis(parse_u64(get("OUTBOUND_MIN_INTERVAL_MS")).unwrap_or(350));
        let temporary_failure_reply = get("TEMPORARY_FAILURE_REPLY")
            .unwrap_or_else(|| DEFAULT_TEMPORARY_FAILURE_REPLY.to_string());
        let missing_assistant_reply = get("MISSING_ASSISTANT_REPLY")
            .unwrap_or_else(|| DEFAULT_MISSING_ASSISTANT_REPLY.to_string());

        let clear_session_on_logout = parse_bool(get("CLEAR_SESSION_ON_LOGOUT")).unwrap_or(false);

        let bridge_max_line_bytes = parse_u64(get("BRIDGE_MAX_LINE_BYTES"))
            .map(|n| n as usize)
            .unwrap_or(8 * 1024 * 1024);

        Ok(Self {
            mongo_url,
            mongo_db,
            mongo_collection,
            session_id: SessionId(session_id),
            assistant_id,
            assistant_command,
            assistant_args,
            assistant_timeout,
            handler_timeout,
            groups_ignore,
            outbound_min_interval,
            temporary_failure_reply,
            missing_assistant_reply,
            clear_session_on_logout,
            bridge_max_line_bytes,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn parse_bool(v: Option<String>) -> Option<bool> {
    v.map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_u64(v: Option<String>) -> Option<u64> {
    v.and_then(|s| s.trim().parse::<u64>().ok())
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
