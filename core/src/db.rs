use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::editor::RecipeStore;
use crate::models::{
    Ingredient, Invitation, NewIngredient, NewSection, NewSectionIngredient, Recipe,
    RecipeAccess, RecipeFields, RecipeSummary, Section, SectionIngredient, Session, SharingGroup,
    Subscription, SubscriptionStatus, TeamMember, TeamRole, User,
};

/// Current UTC time in the format every timestamp column uses. Lexical order
/// matches chronological order.
#[must_use]
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    /// Start a transaction on the shared connection. Every call made through
    /// this `Database` until the guard is committed or dropped is part of it;
    /// dropping without `commit()` rolls back.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        self.conn
            .unchecked_transaction()
            .context("Failed to begin transaction")
    }

    #[allow(clippy::too_many_lines)]
    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    display_name TEXT NOT NULL DEFAULT '',
                    restaurant_name TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sessions (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    token_hash TEXT NOT NULL UNIQUE,
                    remember_me INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recipes (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    owner_id INTEGER NOT NULL REFERENCES users(id),
                    title TEXT NOT NULL CHECK (length(trim(title)) > 0),
                    servings INTEGER NOT NULL DEFAULT 1 CHECK (servings >= 1),
                    category TEXT NOT NULL,
                    notes TEXT NOT NULL DEFAULT '',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recipe_sections (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id),
                    title TEXT NOT NULL DEFAULT '',
                    instructions TEXT NOT NULL DEFAULT '',
                    order_index INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS recipe_ingredients (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id),
                    quantity REAL,
                    unit TEXT NOT NULL DEFAULT '',
                    designation TEXT NOT NULL,
                    order_index INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS section_ingredients (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    section_id INTEGER NOT NULL REFERENCES recipe_sections(id),
                    ingredient_id INTEGER NOT NULL REFERENCES recipe_ingredients(id),
                    order_index INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
                CREATE INDEX IF NOT EXISTS idx_recipes_owner ON recipes(owner_id);
                CREATE INDEX IF NOT EXISTS idx_recipe_sections_recipe ON recipe_sections(recipe_id);
                CREATE INDEX IF NOT EXISTS idx_recipe_ingredients_recipe ON recipe_ingredients(recipe_id);
                CREATE INDEX IF NOT EXISTS idx_section_ingredients_section ON section_ingredients(section_id);
                CREATE INDEX IF NOT EXISTS idx_section_ingredients_ingredient ON section_ingredients(ingredient_id);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS team_members (
                    owner_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    member_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    role TEXT NOT NULL CHECK (role IN ('editor', 'viewer')),
                    joined_at TEXT NOT NULL,
                    PRIMARY KEY (owner_id, member_id)
                );

                CREATE TABLE IF NOT EXISTS invitations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    token TEXT NOT NULL UNIQUE,
                    inviter_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    email TEXT NOT NULL COLLATE NOCASE,
                    role TEXT NOT NULL CHECK (role IN ('editor', 'viewer')),
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL,
                    accepted_at TEXT,
                    accepted_by INTEGER REFERENCES users(id)
                );

                CREATE TABLE IF NOT EXISTS sharing_groups (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    owner_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS group_members (
                    group_id INTEGER NOT NULL REFERENCES sharing_groups(id) ON DELETE CASCADE,
                    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                    joined_at TEXT NOT NULL,
                    PRIMARY KEY (group_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS group_recipes (
                    group_id INTEGER NOT NULL REFERENCES sharing_groups(id) ON DELETE CASCADE,
                    recipe_id INTEGER NOT NULL REFERENCES recipes(id),
                    shared_by INTEGER NOT NULL REFERENCES users(id),
                    shared_at TEXT NOT NULL,
                    PRIMARY KEY (group_id, recipe_id)
                );

                CREATE INDEX IF NOT EXISTS idx_team_members_member ON team_members(member_id);
                CREATE INDEX IF NOT EXISTS idx_invitations_inviter ON invitations(inviter_id);
                CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id);
                CREATE INDEX IF NOT EXISTS idx_group_recipes_recipe ON group_recipes(recipe_id);

                PRAGMA user_version = 2;",
            )?;
        }

        if version < 3 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS subscriptions (
                    user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                    customer_id TEXT NOT NULL UNIQUE,
                    subscription_id TEXT,
                    status TEXT NOT NULL,
                    current_period_end TEXT,
                    updated_at TEXT NOT NULL
                );

                PRAGMA user_version = 3;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            email: row.get(1)?,
            display_name: row.get(2)?,
            restaurant_name: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    fn session_from_row(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get(0)?,
            user_id: row.get(1)?,
            remember_me: row.get(2)?,
            created_at: row.get(3)?,
            expires_at: row.get(4)?,
        })
    }

    fn recipe_from_row(row: &rusqlite::Row) -> rusqlite::Result<Recipe> {
        Ok(Recipe {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            title: row.get(2)?,
            servings: row.get(3)?,
            category: row.get(4)?,
            notes: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn section_from_row(row: &rusqlite::Row) -> rusqlite::Result<Section> {
        Ok(Section {
            id: row.get(0)?,
            recipe_id: row.get(1)?,
            title: row.get(2)?,
            instructions: row.get(3)?,
            order_index: row.get(4)?,
        })
    }

    fn ingredient_from_row(row: &rusqlite::Row) -> rusqlite::Result<Ingredient> {
        Ok(Ingredient {
            id: row.get(0)?,
            recipe_id: row.get(1)?,
            quantity: row.get(2)?,
            unit: row.get(3)?,
            designation: row.get(4)?,
            order_index: row.get(5)?,
        })
    }

    fn link_from_row(row: &rusqlite::Row) -> rusqlite::Result<SectionIngredient> {
        Ok(SectionIngredient {
            id: row.get(0)?,
            section_id: row.get(1)?,
            ingredient_id: row.get(2)?,
            order_index: row.get(3)?,
        })
    }

    fn role_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<TeamRole> {
        let raw: String = row.get(idx)?;
        TeamRole::parse(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    }

    fn status_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<SubscriptionStatus> {
        let raw: String = row.get(idx)?;
        SubscriptionStatus::parse(&raw)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
    }

    // Expects columns:
    // 0: tm.owner_id, 1: tm.member_id, 2: u.email, 3: u.display_name,
    // 4: tm.role, 5: tm.joined_at
    fn team_member_from_row(row: &rusqlite::Row) -> rusqlite::Result<TeamMember> {
        Ok(TeamMember {
            owner_id: row.get(0)?,
            member_id: row.get(1)?,
            email: row.get(2)?,
            display_name: row.get(3)?,
            role: Self::role_column(row, 4)?,
            joined_at: row.get(5)?,
        })
    }

    fn invitation_from_row(row: &rusqlite::Row) -> rusqlite::Result<Invitation> {
        Ok(Invitation {
            id: row.get(0)?,
            token: row.get(1)?,
            inviter_id: row.get(2)?,
            email: row.get(3)?,
            role: Self::role_column(row, 4)?,
            created_at: row.get(5)?,
            expires_at: row.get(6)?,
            accepted_at: row.get(7)?,
            accepted_by: row.get(8)?,
        })
    }

    // Expects columns:
    // 0: g.id, 1: g.name, 2: g.owner_id, 3: g.created_at,
    // 4: member count, 5: recipe count
    fn group_from_row(row: &rusqlite::Row) -> rusqlite::Result<SharingGroup> {
        Ok(SharingGroup {
            id: row.get(0)?,
            name: row.get(1)?,
            owner_id: row.get(2)?,
            created_at: row.get(3)?,
            member_count: row.get(4)?,
            recipe_count: row.get(5)?,
        })
    }

    fn subscription_from_row(row: &rusqlite::Row) -> rusqlite::Result<Subscription> {
        Ok(Subscription {
            user_id: row.get(0)?,
            customer_id: row.get(1)?,
            subscription_id: row.get(2)?,
            status: Self::status_column(row, 3)?,
            current_period_end: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    // --- Users ---

    pub fn insert_user(&self, email: &str, display_name: &str, restaurant_name: &str) -> Result<User> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO users (email, display_name, restaurant_name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![email, display_name, restaurant_name, now],
            )
            .with_context(|| format!("Failed to create user '{email}'"))?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, display_name, restaurant_name, created_at FROM users WHERE id = ?1",
                params![id],
                Self::user_from_row,
            )
            .optional()
            .context("Failed to load user")
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, email, display_name, restaurant_name, created_at FROM users WHERE email = ?1",
                params![email],
                Self::user_from_row,
            )
            .optional()
            .context("Failed to load user")
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, email, display_name, restaurant_name, created_at FROM users ORDER BY email",
        )?;
        let users = stmt
            .query_map([], Self::user_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    // --- Sessions ---

    pub fn insert_session(
        &self,
        user_id: i64,
        token_hash: &str,
        remember_me: bool,
        expires_at: &str,
    ) -> Result<Session> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO sessions (user_id, token_hash, remember_me, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, token_hash, remember_me, now, expires_at],
            )
            .context("Failed to create session")?;
        Ok(Session {
            id: self.conn.last_insert_rowid(),
            user_id,
            remember_me,
            created_at: now,
            expires_at: expires_at.to_string(),
        })
    }

    /// Look up a live session by token hash. Sessions expiring at or before
    /// `now` are not returned.
    pub fn find_session(&self, token_hash: &str, now: &str) -> Result<Option<Session>> {
        self.conn
            .query_row(
                "SELECT id, user_id, remember_me, created_at, expires_at FROM sessions
                 WHERE token_hash = ?1 AND expires_at > ?2",
                params![token_hash, now],
                Self::session_from_row,
            )
            .optional()
            .context("Failed to load session")
    }

    pub fn delete_session(&self, token_hash: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM sessions WHERE token_hash = ?1", params![token_hash])?;
        Ok(rows > 0)
    }

    pub fn delete_expired_sessions(&self, now: &str) -> Result<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM sessions WHERE expires_at <= ?1", params![now])?;
        Ok(rows)
    }

    // --- Recipes ---

    /// The caller's access level to a recipe, or `None` when it does not exist.
    pub fn recipe_access(&self, user_id: i64, recipe_id: i64) -> Result<Option<RecipeAccess>> {
        let owner_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT owner_id FROM recipes WHERE id = ?1",
                params![recipe_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(owner_id) = owner_id else {
            return Ok(None);
        };
        if owner_id == user_id {
            return Ok(Some(RecipeAccess::Owner));
        }
        if let Some(role) = self.team_role(owner_id, user_id)? {
            return Ok(Some(match role {
                TeamRole::Editor => RecipeAccess::Editor,
                TeamRole::Viewer => RecipeAccess::Viewer,
            }));
        }
        let shared: bool = self.conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM group_recipes gr
                JOIN group_members gm ON gm.group_id = gr.group_id
                WHERE gr.recipe_id = ?1 AND gm.user_id = ?2
             )",
            params![recipe_id, user_id],
            |row| row.get(0),
        )?;
        Ok(Some(if shared {
            RecipeAccess::Shared
        } else {
            RecipeAccess::Denied
        }))
    }

    /// Every recipe the user can read, ordered by title.
    pub fn list_readable_recipes(&self, user_id: i64) -> Result<Vec<RecipeSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, r.owner_id, r.title, r.servings, r.category, r.updated_at,
                    (SELECT COUNT(*) FROM recipe_sections s WHERE s.recipe_id = r.id),
                    (SELECT COUNT(*) FROM recipe_ingredients i WHERE i.recipe_id = r.id),
                    CASE WHEN r.owner_id = ?1 THEN 'owner'
                         WHEN tm.role IS NOT NULL THEN tm.role
                         ELSE 'shared' END
             FROM recipes r
             LEFT JOIN team_members tm ON tm.owner_id = r.owner_id AND tm.member_id = ?1
             WHERE r.owner_id = ?1
                OR tm.member_id IS NOT NULL
                OR EXISTS (
                    SELECT 1 FROM group_recipes gr
                    JOIN group_members gm ON gm.group_id = gr.group_id
                    WHERE gr.recipe_id = r.id AND gm.user_id = ?1
                )
             ORDER BY r.title COLLATE NOCASE, r.id",
        )?;
        let recipes = stmt
            .query_map(params![user_id], |row| {
                Ok(RecipeSummary {
                    id: row.get(0)?,
                    owner_id: row.get(1)?,
                    title: row.get(2)?,
                    servings: row.get(3)?,
                    category: row.get(4)?,
                    updated_at: row.get(5)?,
                    section_count: row.get(6)?,
                    ingredient_count: row.get(7)?,
                    access: row.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(recipes)
    }

    /// Remove a recipe and every row that hangs off it. Run inside `begin()`
    /// to make it atomic.
    pub fn delete_recipe(&self, recipe_id: i64) -> Result<bool> {
        self.conn.execute(
            "DELETE FROM section_ingredients
             WHERE section_id IN (SELECT id FROM recipe_sections WHERE recipe_id = ?1)",
            params![recipe_id],
        )?;
        self.conn.execute(
            "DELETE FROM recipe_sections WHERE recipe_id = ?1",
            params![recipe_id],
        )?;
        self.conn.execute(
            "DELETE FROM recipe_ingredients WHERE recipe_id = ?1",
            params![recipe_id],
        )?;
        self.conn.execute(
            "DELETE FROM group_recipes WHERE recipe_id = ?1",
            params![recipe_id],
        )?;
        let rows = self
            .conn
            .execute("DELETE FROM recipes WHERE id = ?1", params![recipe_id])?;
        Ok(rows > 0)
    }

    // --- Teams ---

    pub fn team_role(&self, owner_id: i64, member_id: i64) -> Result<Option<TeamRole>> {
        self.conn
            .query_row(
                "SELECT role FROM team_members WHERE owner_id = ?1 AND member_id = ?2",
                params![owner_id, member_id],
                |row| Self::role_column(row, 0),
            )
            .optional()
            .context("Failed to load team membership")
    }

    pub fn upsert_team_member(&self, owner_id: i64, member_id: i64, role: TeamRole) -> Result<()> {
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO team_members (owner_id, member_id, role, joined_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner_id, member_id) DO UPDATE SET role = excluded.role",
            params![owner_id, member_id, role.as_str(), now],
        )?;
        Ok(())
    }

    pub fn list_team(&self, owner_id: i64) -> Result<Vec<TeamMember>> {
        let mut stmt = self.conn.prepare(
            "SELECT tm.owner_id, tm.member_id, u.email, u.display_name, tm.role, tm.joined_at
             FROM team_members tm
             JOIN users u ON u.id = tm.member_id
             WHERE tm.owner_id = ?1
             ORDER BY u.email",
        )?;
        let members = stmt
            .query_map(params![owner_id], Self::team_member_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    pub fn remove_team_member(&self, owner_id: i64, member_id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM team_members WHERE owner_id = ?1 AND member_id = ?2",
            params![owner_id, member_id],
        )?;
        Ok(rows > 0)
    }

    // --- Invitations ---

    pub fn insert_invitation(
        &self,
        token: &str,
        inviter_id: i64,
        email: &str,
        role: TeamRole,
        expires_at: &str,
    ) -> Result<Invitation> {
        let now = now_rfc3339();
        self.conn
            .execute(
                "INSERT INTO invitations (token, inviter_id, email, role, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![token, inviter_id, email, role.as_str(), now, expires_at],
            )
            .context("Failed to create invitation")?;
        Ok(Invitation {
            id: self.conn.last_insert_rowid(),
            token: token.to_string(),
            inviter_id,
            email: email.to_string(),
            role,
            created_at: now,
            expires_at: expires_at.to_string(),
            accepted_at: None,
            accepted_by: None,
        })
    }

    pub fn get_invitation(&self, token: &str) -> Result<Option<Invitation>> {
        self.conn
            .query_row(
                "SELECT id, token, inviter_id, email, role, created_at, expires_at, accepted_at, accepted_by
                 FROM invitations WHERE token = ?1",
                params![token],
                Self::invitation_from_row,
            )
            .optional()
            .context("Failed to load invitation")
    }

    pub fn list_pending_invitations(&self, inviter_id: i64, now: &str) -> Result<Vec<Invitation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, token, inviter_id, email, role, created_at, expires_at, accepted_at, accepted_by
             FROM invitations
             WHERE inviter_id = ?1 AND accepted_at IS NULL AND expires_at > ?2
             ORDER BY created_at DESC, id DESC",
        )?;
        let invitations = stmt
            .query_map(params![inviter_id, now], Self::invitation_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(invitations)
    }

    pub fn mark_invitation_accepted(&self, invitation_id: i64, user_id: i64) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE invitations SET accepted_at = ?1, accepted_by = ?2
             WHERE id = ?3 AND accepted_at IS NULL",
            params![now_rfc3339(), user_id, invitation_id],
        )?;
        if rows == 0 {
            bail!("Invitation {invitation_id} was already accepted");
        }
        Ok(())
    }

    // --- Sharing groups ---

    const GROUP_COLUMNS: &'static str = "g.id, g.name, g.owner_id, g.created_at,
        (SELECT COUNT(*) FROM group_members m WHERE m.group_id = g.id),
        (SELECT COUNT(*) FROM group_recipes r WHERE r.group_id = g.id)";

    pub fn insert_group(&self, name: &str, owner_id: i64) -> Result<SharingGroup> {
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO sharing_groups (name, owner_id, created_at) VALUES (?1, ?2, ?3)",
            params![name, owner_id, now],
        )?;
        let id = self.conn.last_insert_rowid();
        self.add_group_member(id, owner_id)?;
        self.get_group(id)?.context("Group not found")
    }

    pub fn get_group(&self, group_id: i64) -> Result<Option<SharingGroup>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM sharing_groups g WHERE g.id = ?1",
                    Self::GROUP_COLUMNS
                ),
                params![group_id],
                Self::group_from_row,
            )
            .optional()
            .context("Failed to load group")
    }

    pub fn list_groups_for_user(&self, user_id: i64) -> Result<Vec<SharingGroup>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sharing_groups g
             JOIN group_members gm ON gm.group_id = g.id
             WHERE gm.user_id = ?1
             ORDER BY g.name COLLATE NOCASE, g.id",
            Self::GROUP_COLUMNS
        ))?;
        let groups = stmt
            .query_map(params![user_id], Self::group_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    /// Returns `false` when the user was already a member.
    pub fn add_group_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at) VALUES (?1, ?2, ?3)",
            params![group_id, user_id, now_rfc3339()],
        )?;
        Ok(rows > 0)
    }

    pub fn is_group_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        let member = self.conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2)",
            params![group_id, user_id],
            |row| row.get(0),
        )?;
        Ok(member)
    }

    /// Returns `false` when the recipe was already shared into the group.
    pub fn share_recipe(&self, group_id: i64, recipe_id: i64, shared_by: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "INSERT OR IGNORE INTO group_recipes (group_id, recipe_id, shared_by, shared_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![group_id, recipe_id, shared_by, now_rfc3339()],
        )?;
        Ok(rows > 0)
    }

    pub fn recipe_sharer(&self, group_id: i64, recipe_id: i64) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT shared_by FROM group_recipes WHERE group_id = ?1 AND recipe_id = ?2",
                params![group_id, recipe_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to load shared recipe")
    }

    pub fn unshare_recipe(&self, group_id: i64, recipe_id: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM group_recipes WHERE group_id = ?1 AND recipe_id = ?2",
            params![group_id, recipe_id],
        )?;
        Ok(rows > 0)
    }

    // --- Subscriptions ---

    pub fn get_subscription(&self, user_id: i64) -> Result<Option<Subscription>> {
        self.conn
            .query_row(
                "SELECT user_id, customer_id, subscription_id, status, current_period_end, updated_at
                 FROM subscriptions WHERE user_id = ?1",
                params![user_id],
                Self::subscription_from_row,
            )
            .optional()
            .context("Failed to load subscription")
    }

    /// Bind a processor customer to a user, replacing any earlier binding.
    pub fn upsert_subscription(
        &self,
        user_id: i64,
        customer_id: &str,
        subscription_id: Option<&str>,
        status: SubscriptionStatus,
    ) -> Result<Subscription> {
        self.conn
            .execute(
                "INSERT INTO subscriptions (user_id, customer_id, subscription_id, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    customer_id = excluded.customer_id,
                    subscription_id = COALESCE(excluded.subscription_id, subscriptions.subscription_id),
                    status = excluded.status,
                    updated_at = excluded.updated_at",
                params![user_id, customer_id, subscription_id, status.as_str(), now_rfc3339()],
            )
            .context("Failed to save subscription")?;
        self.get_subscription(user_id)?
            .context("Subscription not found")
    }

    /// Update the subscription of a processor customer. Returns `false` when
    /// the customer is unknown. `None` fields keep their stored value.
    pub fn update_subscription_status(
        &self,
        customer_id: &str,
        status: SubscriptionStatus,
        subscription_id: Option<&str>,
        current_period_end: Option<&str>,
    ) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE subscriptions SET
                status = ?1,
                subscription_id = COALESCE(?2, subscription_id),
                current_period_end = COALESCE(?3, current_period_end),
                updated_at = ?4
             WHERE customer_id = ?5",
            params![
                status.as_str(),
                subscription_id,
                current_period_end,
                now_rfc3339(),
                customer_id
            ],
        )?;
        Ok(rows > 0)
    }
}

impl RecipeStore for Database {
    fn insert_recipe(&self, owner_id: i64, fields: &RecipeFields) -> Result<i64> {
        let now = now_rfc3339();
        self.conn.execute(
            "INSERT INTO recipes (owner_id, title, servings, category, notes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                owner_id,
                fields.title,
                fields.servings,
                fields.category,
                fields.notes,
                now,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn update_recipe(&self, recipe_id: i64, fields: &RecipeFields) -> Result<()> {
        let rows = self.conn.execute(
            "UPDATE recipes SET title = ?1, servings = ?2, category = ?3, notes = ?4, updated_at = ?5
             WHERE id = ?6",
            params![
                fields.title,
                fields.servings,
                fields.category,
                fields.notes,
                now_rfc3339(),
                recipe_id,
            ],
        )?;
        if rows == 0 {
            bail!("Recipe {recipe_id} not found");
        }
        Ok(())
    }

    fn insert_sections(&self, rows: &[NewSection]) -> Result<Vec<Section>> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO recipe_sections (recipe_id, title, instructions, order_index)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        let mut inserted = Vec::with_capacity(rows.len());
        for row in rows {
            stmt.execute(params![row.recipe_id, row.title, row.instructions, row.order_index])?;
            inserted.push(Section {
                id: self.conn.last_insert_rowid(),
                recipe_id: row.recipe_id,
                title: row.title.clone(),
                instructions: row.instructions.clone(),
                order_index: row.order_index,
            });
        }
        Ok(inserted)
    }

    fn insert_ingredients(&self, rows: &[NewIngredient]) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO recipe_ingredients (recipe_id, quantity, unit, designation, order_index)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            stmt.execute(params![
                row.recipe_id,
                row.quantity,
                row.unit,
                row.designation,
                row.order_index
            ])?;
            ids.push(self.conn.last_insert_rowid());
        }
        Ok(ids)
    }

    fn insert_links(&self, rows: &[NewSectionIngredient]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO section_ingredients (section_id, ingredient_id, order_index)
             VALUES (?1, ?2, ?3)",
        )?;
        for row in rows {
            stmt.execute(params![row.section_id, row.ingredient_id, row.order_index])?;
        }
        Ok(())
    }

    fn delete_links_for_sections(&self, section_ids: &[i64]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM section_ingredients WHERE section_id = ?1")?;
        for id in section_ids {
            stmt.execute(params![id])?;
        }
        Ok(())
    }

    fn delete_sections(&self, section_ids: &[i64]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM recipe_sections WHERE id = ?1")?;
        for id in section_ids {
            stmt.execute(params![id])?;
        }
        Ok(())
    }

    fn delete_ingredients(&self, ingredient_ids: &[i64]) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM recipe_ingredients WHERE id = ?1")?;
        for id in ingredient_ids {
            stmt.execute(params![id])?;
        }
        Ok(())
    }

    fn get_recipe(&self, recipe_id: i64) -> Result<Option<Recipe>> {
        self.conn
            .query_row(
                "SELECT id, owner_id, title, servings, category, notes, created_at, updated_at
                 FROM recipes WHERE id = ?1",
                params![recipe_id],
                Self::recipe_from_row,
            )
            .optional()
            .context("Failed to load recipe")
    }

    fn list_sections(&self, recipe_id: i64) -> Result<Vec<Section>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, recipe_id, title, instructions, order_index FROM recipe_sections
             WHERE recipe_id = ?1 ORDER BY order_index, id",
        )?;
        let sections = stmt
            .query_map(params![recipe_id], Self::section_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sections)
    }

    fn list_ingredients(&self, recipe_id: i64) -> Result<Vec<Ingredient>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, recipe_id, quantity, unit, designation, order_index FROM recipe_ingredients
             WHERE recipe_id = ?1 ORDER BY order_index, id",
        )?;
        let ingredients = stmt
            .query_map(params![recipe_id], Self::ingredient_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ingredients)
    }

    fn list_links(&self, recipe_id: i64) -> Result<Vec<SectionIngredient>> {
        let mut stmt = self.conn.prepare(
            "SELECT l.id, l.section_id, l.ingredient_id, l.order_index
             FROM section_ingredients l
             JOIN recipe_sections s ON s.id = l.section_id
             WHERE s.recipe_id = ?1
             ORDER BY l.order_index, l.id",
        )?;
        let links = stmt
            .query_map(params![recipe_id], Self::link_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_user() -> (Database, User) {
        let db = Database::open_in_memory().unwrap();
        let user = db.insert_user("chef@bistro.fr", "Chef", "Le Bistro").unwrap();
        (db, user)
    }

    fn fields(title: &str) -> RecipeFields {
        RecipeFields {
            title: title.to_string(),
            servings: 4,
            category: "main".to_string(),
            notes: String::new(),
        }
    }

    fn seed_recipe(db: &Database, owner_id: i64, title: &str) -> (i64, Vec<Section>, Vec<i64>) {
        let recipe_id = db.insert_recipe(owner_id, &fields(title)).unwrap();
        let sections = db
            .insert_sections(&[
                NewSection {
                    recipe_id,
                    title: "Sauce".to_string(),
                    instructions: "Reduce".to_string(),
                    order_index: 0,
                },
                NewSection {
                    recipe_id,
                    title: "Base".to_string(),
                    instructions: String::new(),
                    order_index: 1,
                },
            ])
            .unwrap();
        let ingredients = db
            .insert_ingredients(&[
                NewIngredient {
                    recipe_id,
                    quantity: Some(0.5),
                    unit: "l".to_string(),
                    designation: "fond".to_string(),
                    order_index: 0,
                },
                NewIngredient {
                    recipe_id,
                    quantity: None,
                    unit: String::new(),
                    designation: "sel".to_string(),
                    order_index: 1,
                },
            ])
            .unwrap();
        db.insert_links(&[
            NewSectionIngredient {
                section_id: sections[0].id,
                ingredient_id: ingredients[0],
                order_index: 0,
            },
            NewSectionIngredient {
                section_id: sections[0].id,
                ingredient_id: ingredients[1],
                order_index: 1,
            },
        ])
        .unwrap();
        (recipe_id, sections, ingredients)
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brigade.db");
        {
            let db = Database::open(&path).unwrap();
            db.insert_user("a@b.c", "", "").unwrap();
        }
        let db = Database::open(&path).unwrap();
        let version: i64 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 3);
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn test_user_email_unique_case_insensitive() {
        let (db, user) = db_with_user();
        assert!(db.insert_user("CHEF@bistro.fr", "", "").is_err());
        let found = db.get_user_by_email("chef@BISTRO.fr").unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(db.get_user(user.id + 100).unwrap().is_none());
    }

    #[test]
    fn test_session_expiry() {
        let (db, user) = db_with_user();
        db.insert_session(user.id, "live", true, "2999-01-01T00:00:00Z")
            .unwrap();
        db.insert_session(user.id, "stale", false, "2000-01-01T00:00:00Z")
            .unwrap();

        let now = now_rfc3339();
        let live = db.find_session("live", &now).unwrap().unwrap();
        assert_eq!(live.user_id, user.id);
        assert!(live.remember_me);
        assert!(db.find_session("stale", &now).unwrap().is_none());

        assert_eq!(db.delete_expired_sessions(&now).unwrap(), 1);
        assert!(db.delete_session("live").unwrap());
        assert!(!db.delete_session("live").unwrap());
    }

    #[test]
    fn test_sections_and_ingredients_ordered() {
        let (db, user) = db_with_user();
        let (recipe_id, sections, ingredients) = seed_recipe(&db, user.id, "Blanquette");

        let listed = db.list_sections(recipe_id).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].title, "Sauce");
        assert_eq!(listed[0].id, sections[0].id);

        let listed = db.list_ingredients(recipe_id).unwrap();
        assert_eq!(listed.iter().map(|i| i.id).collect::<Vec<_>>(), ingredients);
        assert_eq!(listed[0].quantity, Some(0.5));
        assert_eq!(listed[1].quantity, None);

        let links = db.list_links(recipe_id).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|l| l.section_id == sections[0].id));
    }

    #[test]
    fn test_section_delete_blocked_by_links() {
        let (db, user) = db_with_user();
        let (_, sections, ingredients) = seed_recipe(&db, user.id, "Blanquette");
        let ids: Vec<i64> = sections.iter().map(|s| s.id).collect();

        assert!(db.delete_sections(&ids).is_err());
        assert!(db.delete_ingredients(&ingredients).is_err());

        db.delete_links_for_sections(&ids).unwrap();
        db.delete_sections(&ids).unwrap();
        db.delete_ingredients(&ingredients).unwrap();
    }

    #[test]
    fn test_update_missing_recipe_errors() {
        let (db, _) = db_with_user();
        let err = db.update_recipe(99, &fields("Ghost")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_blank_title_rejected_by_schema() {
        let (db, user) = db_with_user();
        assert!(db.insert_recipe(user.id, &fields("  ")).is_err());
    }

    #[test]
    fn test_transaction_rollback_on_drop() {
        let (db, user) = db_with_user();
        {
            let _tx = db.begin().unwrap();
            db.insert_recipe(user.id, &fields("Draft")).unwrap();
        }
        assert!(db.list_readable_recipes(user.id).unwrap().is_empty());

        let tx = db.begin().unwrap();
        db.insert_recipe(user.id, &fields("Kept")).unwrap();
        tx.commit().unwrap();
        assert_eq!(db.list_readable_recipes(user.id).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_recipe_removes_children() {
        let (db, user) = db_with_user();
        let (recipe_id, _, _) = seed_recipe(&db, user.id, "Blanquette");
        let group = db.insert_group("Cuisine", user.id).unwrap();
        db.share_recipe(group.id, recipe_id, user.id).unwrap();

        assert!(db.delete_recipe(recipe_id).unwrap());
        assert!(db.get_recipe(recipe_id).unwrap().is_none());
        assert!(db.list_sections(recipe_id).unwrap().is_empty());
        assert!(db.list_ingredients(recipe_id).unwrap().is_empty());
        assert_eq!(db.get_group(group.id).unwrap().unwrap().recipe_count, 0);
        assert!(!db.delete_recipe(recipe_id).unwrap());
    }

    #[test]
    fn test_recipe_access_levels() {
        let (db, owner) = db_with_user();
        let editor = db.insert_user("sous@bistro.fr", "", "").unwrap();
        let viewer = db.insert_user("commis@bistro.fr", "", "").unwrap();
        let friend = db.insert_user("ami@ailleurs.fr", "", "").unwrap();
        let stranger = db.insert_user("x@y.z", "", "").unwrap();
        let (recipe_id, _, _) = seed_recipe(&db, owner.id, "Blanquette");

        db.upsert_team_member(owner.id, editor.id, TeamRole::Editor)
            .unwrap();
        db.upsert_team_member(owner.id, viewer.id, TeamRole::Viewer)
            .unwrap();
        let group = db.insert_group("Amis", owner.id).unwrap();
        db.add_group_member(group.id, friend.id).unwrap();
        db.share_recipe(group.id, recipe_id, owner.id).unwrap();

        let access = |user: i64| db.recipe_access(user, recipe_id).unwrap().unwrap();
        assert_eq!(access(owner.id), RecipeAccess::Owner);
        assert_eq!(access(editor.id), RecipeAccess::Editor);
        assert_eq!(access(viewer.id), RecipeAccess::Viewer);
        assert_eq!(access(friend.id), RecipeAccess::Shared);
        assert_eq!(access(stranger.id), RecipeAccess::Denied);
        assert!(db.recipe_access(owner.id, 999).unwrap().is_none());

        let listed = db.list_readable_recipes(friend.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].access, "shared");
        assert_eq!(listed[0].section_count, 2);
        assert_eq!(listed[0].ingredient_count, 2);
        assert_eq!(db.list_readable_recipes(editor.id).unwrap()[0].access, "editor");
        assert!(db.list_readable_recipes(stranger.id).unwrap().is_empty());
    }

    #[test]
    fn test_list_readable_recipes_by_title() {
        let (db, user) = db_with_user();
        db.insert_recipe(user.id, &fields("tarte")).unwrap();
        db.insert_recipe(user.id, &fields("Aïoli")).unwrap();
        db.insert_recipe(user.id, &fields("Blanquette")).unwrap();
        let titles: Vec<String> = db
            .list_readable_recipes(user.id)
            .unwrap()
            .into_iter()
            .map(|r| r.title)
            .collect();
        assert_eq!(titles, ["Aïoli", "Blanquette", "tarte"]);
    }

    #[test]
    fn test_team_upsert_changes_role() {
        let (db, owner) = db_with_user();
        let member = db.insert_user("sous@bistro.fr", "Sous", "").unwrap();
        db.upsert_team_member(owner.id, member.id, TeamRole::Viewer)
            .unwrap();
        db.upsert_team_member(owner.id, member.id, TeamRole::Editor)
            .unwrap();
        let team = db.list_team(owner.id).unwrap();
        assert_eq!(team.len(), 1);
        assert_eq!(team[0].role, TeamRole::Editor);
        assert_eq!(team[0].email, "sous@bistro.fr");

        assert!(db.remove_team_member(owner.id, member.id).unwrap());
        assert!(db.team_role(owner.id, member.id).unwrap().is_none());
    }

    #[test]
    fn test_invitation_accept_once() {
        let (db, owner) = db_with_user();
        let member = db.insert_user("sous@bistro.fr", "", "").unwrap();
        let inv = db
            .insert_invitation("tok", owner.id, "sous@bistro.fr", TeamRole::Editor, "2999-01-01T00:00:00Z")
            .unwrap();
        assert_eq!(
            db.list_pending_invitations(owner.id, &now_rfc3339())
                .unwrap()
                .len(),
            1
        );

        db.mark_invitation_accepted(inv.id, member.id).unwrap();
        assert!(db.mark_invitation_accepted(inv.id, member.id).is_err());

        let stored = db.get_invitation("tok").unwrap().unwrap();
        assert_eq!(stored.accepted_by, Some(member.id));
        assert!(
            db.list_pending_invitations(owner.id, &now_rfc3339())
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_groups_counts_and_membership() {
        let (db, owner) = db_with_user();
        let other = db.insert_user("ami@ailleurs.fr", "", "").unwrap();
        let group = db.insert_group("Amis", owner.id).unwrap();
        assert_eq!(group.member_count, 1);
        assert!(db.is_group_member(group.id, owner.id).unwrap());

        assert!(db.add_group_member(group.id, other.id).unwrap());
        assert!(!db.add_group_member(group.id, other.id).unwrap());

        let (recipe_id, _, _) = seed_recipe(&db, owner.id, "Tarte");
        assert!(db.share_recipe(group.id, recipe_id, owner.id).unwrap());
        assert!(!db.share_recipe(group.id, recipe_id, owner.id).unwrap());
        assert_eq!(db.recipe_sharer(group.id, recipe_id).unwrap(), Some(owner.id));

        let groups = db.list_groups_for_user(other.id).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_count, 2);
        assert_eq!(groups[0].recipe_count, 1);

        assert!(db.unshare_recipe(group.id, recipe_id).unwrap());
        assert!(!db.unshare_recipe(group.id, recipe_id).unwrap());
    }

    #[test]
    fn test_subscription_upsert_and_status() {
        let (db, user) = db_with_user();
        assert!(db.get_subscription(user.id).unwrap().is_none());

        let sub = db
            .upsert_subscription(user.id, "cus_1", Some("sub_1"), SubscriptionStatus::Active)
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);

        assert!(
            db.update_subscription_status("cus_1", SubscriptionStatus::PastDue, None, Some("2030-01-01T00:00:00Z"))
                .unwrap()
        );
        let sub = db.get_subscription(user.id).unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(sub.current_period_end.as_deref(), Some("2030-01-01T00:00:00Z"));

        assert!(
            !db.update_subscription_status("cus_unknown", SubscriptionStatus::Active, None, None)
                .unwrap()
        );
    }
}
