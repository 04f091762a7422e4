use sqlx::migrate::Migrator;

/// Schema migrations for `messages` and `conversation_seq`
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");
