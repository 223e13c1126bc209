use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};

pub const ADMIN_ROLE: &str = "admin";

/// Answers whether an already-authenticated caller may run imports.
pub trait AdminCheck {
    fn is_admin(&self, caller: &str) -> anyhow::Result<bool>;
}

/// Role grants kept in the workspace `user_roles` table.
pub struct RoleTable<'c> {
    conn: &'c Connection,
}

impl<'c> RoleTable<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        RoleTable { conn }
    }
}

impl AdminCheck for RoleTable<'_> {
    fn is_admin(&self, caller: &str) -> anyhow::Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM user_roles WHERE user_id = ? AND role = ?",
                (caller, ADMIN_ROLE),
                |_| Ok(()),
            )
            .optional()
            .context("role lookup failed")?;
        Ok(found.is_some())
    }
}
