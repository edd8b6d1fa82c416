use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Number of migrations compiled into the binary. After `run_pending`
/// succeeds this is also the number applied to the database.
pub fn available() -> usize {
    MIGRATOR.iter().count()
}
