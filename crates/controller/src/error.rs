use sqlx::Error as SqlxError;

/// Database failures callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    /// SQLite lock contention; safe to retry on the next pass.
    Busy,
}

fn classify_db_error(code: Option<&str>, message: &str) -> Option<DbErrorKind> {
    let code = code.unwrap_or_default();
    let message = message.to_ascii_lowercase();

    if matches!(code, "2067" | "1555") || message.contains("unique constraint") {
        return Some(DbErrorKind::UniqueViolation);
    }
    if code == "787" || message.contains("foreign key constraint") {
        return Some(DbErrorKind::ForeignKeyViolation);
    }
    if matches!(code, "5" | "6" | "517")
        || message.contains("database is locked")
        || message.contains("database is busy")
    {
        return Some(DbErrorKind::Busy);
    }
    None
}

/// Classifies the first sqlx error in the chain.
pub fn db_error_kind(err: &anyhow::Error) -> Option<DbErrorKind> {
    let sqlx_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<SqlxError>())?;
    match sqlx_err {
        SqlxError::Database(db_err) => classify_db_error(db_err.code().as_deref(), db_err.message()),
        SqlxError::PoolTimedOut => Some(DbErrorKind::Busy),
        _ => None,
    }
}

pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    db_error_kind(err) == Some(DbErrorKind::UniqueViolation)
}

pub fn is_busy(err: &anyhow::Error) -> bool {
    db_error_kind(err) == Some(DbErrorKind::Busy)
}
