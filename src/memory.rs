//! Conversation memory
//!
//! Keeps one [`Conversation`] per `(user, channel)` pair and drops the ones
//! idle for longer than [`RETENTION_HOURS`]. The whole memory can be written to
//! and read back from a compact, versioned JSON document:
//!
//! ```json
//! {"v":1,"c":[{"u":"alice","c":"general","s":"...","l":"...","m":[{"r":1,"c":"hi"}]}]}
//! ```
//!
//! Role codes in `r` are those of [`Role::code`]; zero values and empty
//! strings are omitted.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LlmHostError, Result};
use crate::llm::{Message, Role};

/// Idle hours after which a conversation is forgotten
pub const RETENTION_HOURS: i64 = 24;

const FORMAT_VERSION: u32 = 1;

/// Exchange with one user in one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub user: String,
    pub channel: String,
    pub started: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Conversation {
    fn new(user: &str, channel: &str, now: DateTime<Utc>) -> Self {
        Self {
            user: user.to_string(),
            channel: channel.to_string(),
            started: now,
            last_update: now,
            messages: Vec::new(),
        }
    }
}

type Key = (String, String);

/// All conversations the bot currently remembers
#[derive(Debug, Default)]
pub struct Memory {
    conversations: Mutex<HashMap<Key, Arc<Mutex<Conversation>>>>,
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the conversation for the pair, creating it if needed.
    ///
    /// Either way its `last_update` is set to now.
    ///
    /// # Examples
    ///
    /// ```
    /// use llmhost::memory::Memory;
    ///
    /// let mem = Memory::new();
    /// let a = mem.get("alice", "general");
    /// let b = mem.get("alice", "general");
    /// assert!(std::sync::Arc::ptr_eq(&a, &b));
    /// assert_eq!(mem.len(), 1);
    /// ```
    pub fn get(&self, user: &str, channel: &str) -> Arc<Mutex<Conversation>> {
        let now = Utc::now();
        let mut map = lock(&self.conversations);
        let key = (user.to_string(), channel.to_string());
        if let Some(conv) = map.get(&key) {
            lock(conv).last_update = now;
            return Arc::clone(conv);
        }
        let conv = Arc::new(Mutex::new(Conversation::new(user, channel, now)));
        map.insert(key, Arc::clone(&conv));
        conv
    }

    /// Clears the messages of one conversation.
    ///
    /// Returns false when the pair had no conversation.
    pub fn reset(&self, user: &str, channel: &str) -> bool {
        let map = lock(&self.conversations);
        match map.get(&(user.to_string(), channel.to_string())) {
            Some(conv) => {
                let mut conv = lock(conv);
                conv.messages.clear();
                conv.last_update = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Number of remembered conversations
    pub fn len(&self) -> usize {
        lock(&self.conversations).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops conversations idle for longer than [`RETENTION_HOURS`].
    pub fn forget(&self) -> usize {
        self.forget_at(Utc::now())
    }

    /// Same as [`Memory::forget`] with an explicit clock.
    ///
    /// Returns the number of conversations removed.
    pub fn forget_at(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(RETENTION_HOURS);
        let mut map = lock(&self.conversations);
        let before = map.len();

        // Sort newest first, then cut at the first stale entry.
        let mut recency: Vec<(DateTime<Utc>, Key)> = map
            .iter()
            .map(|(key, conv)| (lock(conv).last_update, key.clone()))
            .collect();
        recency.sort_by(|a, b| b.0.cmp(&a.0));
        let keep = recency.partition_point(|(last_update, _)| *last_update >= cutoff);
        for (_, key) in recency.drain(keep..) {
            map.remove(&key);
        }

        let removed = before - map.len();
        tracing::info!(action = "forget", before, after = map.len(), "memory");
        removed
    }

    /// Owned copies of every conversation, sorted by user then channel.
    pub fn snapshot(&self) -> Vec<Conversation> {
        let map = lock(&self.conversations);
        let mut out: Vec<Conversation> = map.values().map(|c| lock(c).clone()).collect();
        out.sort_by(|a, b| (&a.user, &a.channel).cmp(&(&b.user, &b.channel)));
        out
    }

    /// Write every live conversation as versioned JSON.
    ///
    /// Stale conversations are forgotten first.
    ///
    /// # Errors
    ///
    /// Returns a serialization or IO error from the writer.
    pub fn save<W: Write>(&self, mut writer: W) -> Result<()> {
        self.forget();
        let mut conversations = self.snapshot();
        conversations.sort_by(|a, b| b.last_update.cmp(&a.last_update));
        let doc = SerializedMemory {
            version: FORMAT_VERSION,
            conversations: conversations.iter().map(SerializedConversation::from).collect(),
        };
        serde_json::to_writer(&mut writer, &doc)?;
        writer.write_all(b"\n")?;
        tracing::info!(action = "save", conversations = doc.conversations.len(), "memory");
        Ok(())
    }

    /// Replace the contents with a document produced by [`Memory::save`].
    ///
    /// Stale conversations are forgotten after loading. When the document
    /// holds the same pair twice, the most recent one wins.
    ///
    /// # Errors
    ///
    /// Returns `LlmHostError::Memory` for an unknown version or role code,
    /// or a serialization error for malformed JSON. The current contents
    /// are untouched on error.
    pub fn load<R: Read>(&self, reader: R) -> Result<()> {
        let doc: SerializedMemory =
            serde_json::from_reader(reader).map_err(LlmHostError::from)?;
        if doc.version != FORMAT_VERSION {
            return Err(LlmHostError::Memory(format!(
                "can't load unknown version {}",
                doc.version
            ))
            .into());
        }

        let mut loaded: HashMap<Key, Conversation> = HashMap::new();
        for c in doc.conversations {
            let conv = c.into_conversation()?;
            let key = (conv.user.clone(), conv.channel.clone());
            match loaded.get(&key) {
                Some(existing) if existing.last_update >= conv.last_update => {}
                _ => {
                    loaded.insert(key, conv);
                }
            }
        }

        let count = loaded.len();
        {
            let mut map = lock(&self.conversations);
            *map = loaded
                .into_iter()
                .map(|(k, v)| (k, Arc::new(Mutex::new(v))))
                .collect();
        }
        tracing::info!(action = "load", conversations = count, "memory");
        self.forget();
        Ok(())
    }

    /// Load from `path`; a missing file leaves the memory empty.
    ///
    /// # Errors
    ///
    /// Same as [`Memory::load`], plus IO errors other than not found.
    pub fn load_file(&self, path: &Path) -> Result<()> {
        match std::fs::File::open(path) {
            Ok(file) => self.load(std::io::BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no memory file, starting empty");
                Ok(())
            }
            Err(e) => Err(LlmHostError::Io(e).into()),
        }
    }

    /// Save to `path` through a temporary file renamed into place.
    ///
    /// # Errors
    ///
    /// Returns IO or serialization errors.
    pub fn save_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let file = std::fs::File::create(&tmp)?;
            let mut writer = std::io::BufWriter::new(file);
            self.save(&mut writer)?;
            writer.flush()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn is_zero(v: &u8) -> bool {
    *v == 0
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SerializedMemory {
    #[serde(rename = "v", default)]
    version: u32,
    #[serde(rename = "c", default, skip_serializing_if = "Vec::is_empty")]
    conversations: Vec<SerializedConversation>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SerializedConversation {
    #[serde(rename = "u", default, skip_serializing_if = "String::is_empty")]
    user: String,
    #[serde(rename = "c", default, skip_serializing_if = "String::is_empty")]
    channel: String,
    #[serde(rename = "s")]
    started: DateTime<Utc>,
    #[serde(rename = "l")]
    last_update: DateTime<Utc>,
    #[serde(rename = "m", default, skip_serializing_if = "Vec::is_empty")]
    messages: Vec<SerializedMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SerializedMessage {
    #[serde(rename = "r", default, skip_serializing_if = "is_zero")]
    role: u8,
    #[serde(rename = "c", default, skip_serializing_if = "String::is_empty")]
    content: String,
}

impl From<&Conversation> for SerializedConversation {
    fn from(c: &Conversation) -> Self {
        Self {
            user: c.user.clone(),
            channel: c.channel.clone(),
            started: c.started,
            last_update: c.last_update,
            messages: c
                .messages
                .iter()
                .map(|m| SerializedMessage {
                    role: m.role.code(),
                    content: m.content.clone(),
                })
                .collect(),
        }
    }
}

impl SerializedConversation {
    fn into_conversation(self) -> Result<Conversation> {
        let messages = self
            .messages
            .into_iter()
            .map(|m| Ok(Message::new(Role::from_code(m.role)?, m.content)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Conversation {
            user: self.user,
            channel: self.channel,
            started: self.started,
            last_update: self.last_update,
            messages,
        })
    }
}
