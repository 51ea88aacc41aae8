use rusqlite::OptionalExtension;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use helpdock_core::error::HelpDockError;
use helpdock_core::types::{ChatMessage, Review, VisitorInfo, VisitorPresence};

pub struct Database {
    conn: Mutex<Connection>,
}

/// Run a blocking database closure on the tokio blocking pool.
pub async fn call_blocking<T, F>(db: std::sync::Arc<Database>, f: F) -> Result<T, HelpDockError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> Result<T, HelpDockError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(db.as_ref()))
        .await
        .map_err(|e| HelpDockError::Config(format!("DB task join error: {e}")))?
}

/// A frozen campaign view record for one visitor+campaign pair.
#[derive(Debug, Clone)]
pub struct CampaignViewRow {
    pub count: i64,
    pub last_view: String,
    pub views: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub conversation_id: String,
    pub visitor_id: String,
    pub chatbot_id: String,
    pub close_reason: String,
    pub closed_at: String,
    pub rating: Option<i64>,
    pub review_data: Option<String>,
}

const SCHEMA_VERSION_CURRENT: i64 = 1;

fn get_schema_version(conn: &Connection) -> Result<i64, HelpDockError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS db_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM db_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|s| s.parse::<i64>().ok()).unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i64) -> Result<(), HelpDockError> {
    conn.execute(
        "INSERT INTO db_meta(key, value) VALUES('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![version.to_string()],
    )?;
    Ok(())
}

impl Database {
    pub fn new(data_dir: &str) -> Result<Self, HelpDockError> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = Path::new(data_dir).join("helpdock.db");
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn)
    }

    /// In-memory database for tests.
    pub fn in_memory() -> Result<Self, HelpDockError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, HelpDockError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS presence (
                room TEXT PRIMARY KEY,
                visitor_id TEXT NOT NULL,
                chatbot_id TEXT NOT NULL,
                socket_id TEXT NOT NULL,
                ip_address TEXT,
                city TEXT,
                region TEXT,
                country TEXT,
                lat REAL,
                long REAL,
                last_seen TEXT NOT NULL,
                is_online INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_presence_chatbot_online
                ON presence(chatbot_id, is_online);

            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                visitor_id TEXT NOT NULL,
                chatbot_id TEXT NOT NULL,
                close_reason TEXT NOT NULL,
                closed_at TEXT NOT NULL,
                rating INTEGER,
                review_data TEXT
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, seq);

            CREATE TABLE IF NOT EXISTS campaigns (
                campaign_id TEXT PRIMARY KEY,
                definition TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS campaign_views (
                visitor_id TEXT NOT NULL,
                campaign_id TEXT NOT NULL,
                count INTEGER NOT NULL,
                last_view TEXT NOT NULL,
                views TEXT NOT NULL,
                PRIMARY KEY (visitor_id, campaign_id)
            );",
        )?;
        if get_schema_version(&conn)? < SCHEMA_VERSION_CURRENT {
            set_schema_version(&conn, SCHEMA_VERSION_CURRENT)?;
        }
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, HelpDockError> {
        self.conn
            .lock()
            .map_err(|_| HelpDockError::Config("database lock poisoned".into()))
    }

    // ---- presence ----

    /// Insert-or-refresh a presence row. Single statement, so concurrent
    /// joins for the same room can never produce two rows; the latest
    /// visitor info wins.
    pub fn upsert_presence(
        &self,
        room: &str,
        info: &VisitorInfo,
        now: &str,
    ) -> Result<(), HelpDockError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO presence (room, visitor_id, chatbot_id, socket_id, ip_address,
                                   city, region, country, lat, long, last_seen, is_online)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1)
             ON CONFLICT(room) DO UPDATE SET
                 visitor_id = excluded.visitor_id,
                 chatbot_id = excluded.chatbot_id,
                 socket_id = excluded.socket_id,
                 ip_address = excluded.ip_address,
                 city = excluded.city,
                 region = excluded.region,
                 country = excluded.country,
                 lat = excluded.lat,
                 long = excluded.long,
                 last_seen = excluded.last_seen,
                 is_online = 1",
            params![
                room,
                info.visitor_id,
                info.chatbot_id,
                info.socket_id,
                info.ip_address,
                info.city,
                info.region,
                info.country,
                info.lat,
                info.long,
                now,
            ],
        )?;
        Ok(())
    }

    /// Returns false when the room is unknown (benign no-op for callers).
    pub fn heartbeat_presence(&self, room: &str, now: &str) -> Result<bool, HelpDockError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE presence SET last_seen = ?2, is_online = 1 WHERE room = ?1",
            params![room, now],
        )?;
        Ok(updated > 0)
    }

    pub fn mark_presence_offline(&self, room: &str) -> Result<bool, HelpDockError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE presence SET is_online = 0 WHERE room = ?1",
            params![room],
        )?;
        Ok(updated > 0)
    }

    /// Flip rows offline whose last_seen is older than the cutoff. Returns
    /// how many rows were flipped.
    pub fn evict_stale_presence(&self, cutoff: &str) -> Result<usize, HelpDockError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE presence SET is_online = 0 WHERE is_online = 1 AND last_seen < ?1",
            params![cutoff],
        )?;
        Ok(updated)
    }

    pub fn list_online_presence(
        &self,
        chatbot_id: &str,
    ) -> Result<Vec<VisitorPresence>, HelpDockError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT room, visitor_id, chatbot_id, socket_id, ip_address, city, region,
                    country, lat, long, last_seen, is_online
             FROM presence
             WHERE chatbot_id = ?1 AND is_online = 1
             ORDER BY last_seen DESC",
        )?;
        let rows = stmt.query_map(params![chatbot_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<f64>>(8)?,
                row.get::<_, Option<f64>>(9)?,
                row.get::<_, String>(10)?,
                row.get::<_, bool>(11)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (
                room,
                visitor_id,
                chatbot_id,
                socket_id,
                ip_address,
                city,
                region,
                country,
                lat,
                long,
                last_seen,
                is_online,
            ) = row?;
            let last_seen = chrono::DateTime::parse_from_rfc3339(&last_seen)
                .map_err(|e| HelpDockError::Config(format!("bad last_seen timestamp: {e}")))?
                .with_timezone(&chrono::Utc);
            out.push(VisitorPresence {
                room,
                visitor_id,
                chatbot_id,
                socket_id,
                ip_address,
                city,
                region,
                country,
                lat,
                long,
                last_seen,
                is_online,
            });
        }
        Ok(out)
    }

    // ---- conversations ----

    /// Persist a closed conversation and its frozen history.
    pub fn store_closed_conversation(
        &self,
        conversation_id: &str,
        visitor_id: &str,
        chatbot_id: &str,
        close_reason: &str,
        closed_at: &str,
        history: &[ChatMessage],
    ) -> Result<(), HelpDockError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (conversation_id, visitor_id, chatbot_id,
                                        close_reason, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(conversation_id) DO NOTHING",
            params![conversation_id, visitor_id, chatbot_id, close_reason, closed_at],
        )?;
        tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        for (seq, msg) in history.iter().enumerate() {
            tx.execute(
                "INSERT INTO messages (id, conversation_id, seq, role, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    conversation_id,
                    seq as i64,
                    msg.role.as_str(),
                    msg.text,
                    msg.timestamp.to_rfc3339(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<StoredConversation>, HelpDockError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT conversation_id, visitor_id, chatbot_id, close_reason, closed_at,
                        rating, review_data
                 FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                |row| {
                    Ok(StoredConversation {
                        conversation_id: row.get(0)?,
                        visitor_id: row.get(1)?,
                        chatbot_id: row.get(2)?,
                        close_reason: row.get(3)?,
                        closed_at: row.get(4)?,
                        rating: row.get(5)?,
                        review_data: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_conversation_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, HelpDockError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT role, content, timestamp FROM messages
             WHERE conversation_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (role, text, timestamp) = row?;
            let role = role
                .parse()
                .map_err(|e: String| HelpDockError::Config(e))?;
            let timestamp = chrono::DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| HelpDockError::Config(format!("bad message timestamp: {e}")))?
                .with_timezone(&chrono::Utc);
            out.push(ChatMessage {
                role,
                text,
                timestamp,
            });
        }
        Ok(out)
    }

    /// Attach a post-chat review. Fails once a review exists.
    pub fn attach_review(
        &self,
        conversation_id: &str,
        review: &Review,
    ) -> Result<(), HelpDockError> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE conversations SET rating = ?2, review_data = ?3
             WHERE conversation_id = ?1 AND rating IS NULL",
            params![conversation_id, review.rating as i64, review.review_data],
        )?;
        if updated > 0 {
            return Ok(());
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(HelpDockError::ReviewAlreadySubmitted(
                conversation_id.to_string(),
            )),
            None => Err(HelpDockError::NotFound(format!(
                "conversation {conversation_id}"
            ))),
        }
    }

    // ---- campaigns ----

    pub fn upsert_campaign(
        &self,
        campaign_id: &str,
        definition: &str,
        now: &str,
    ) -> Result<(), HelpDockError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO campaigns (campaign_id, definition, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(campaign_id) DO UPDATE SET
                 definition = excluded.definition,
                 updated_at = excluded.updated_at",
            params![campaign_id, definition, now],
        )?;
        Ok(())
    }

    pub fn get_campaign(&self, campaign_id: &str) -> Result<Option<String>, HelpDockError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT definition FROM campaigns WHERE campaign_id = ?1",
                params![campaign_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw)
    }

    pub fn list_campaigns(&self) -> Result<Vec<String>, HelpDockError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT definition FROM campaigns ORDER BY campaign_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ---- campaign view records ----

    pub fn get_campaign_view(
        &self,
        visitor_id: &str,
        campaign_id: &str,
    ) -> Result<Option<CampaignViewRow>, HelpDockError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT count, last_view, views FROM campaign_views
                 WHERE visitor_id = ?1 AND campaign_id = ?2",
                params![visitor_id, campaign_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((count, last_view, views)) => {
                let views: Vec<String> = serde_json::from_str(&views)?;
                Ok(Some(CampaignViewRow {
                    count,
                    last_view,
                    views,
                }))
            }
        }
    }

    pub fn put_campaign_view(
        &self,
        visitor_id: &str,
        campaign_id: &str,
        view: &CampaignViewRow,
    ) -> Result<(), HelpDockError> {
        let views = serde_json::to_string(&view.views)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO campaign_views (visitor_id, campaign_id, count, last_view, views)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(visitor_id, campaign_id) DO UPDATE SET
                 count = excluded.count,
                 last_view = excluded.last_view,
                 views = excluded.views",
            params![visitor_id, campaign_id, view.count, view.last_view, views],
        )?;
        Ok(())
    }

    pub fn delete_campaign_view(
        &self,
        visitor_id: &str,
        campaign_id: &str,
    ) -> Result<bool, HelpDockError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM campaign_views WHERE visitor_id = ?1 AND campaign_id = ?2",
            params![visitor_id, campaign_id],
        )?;
        Ok(deleted > 0)
    }
}
