use std::path::Path;

use anyhow::Context;
use chrono::{Duration, SecondsFormat, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::billing::BillingEvent;
use crate::db::{Database, now_rfc3339};
use crate::editor::{self, RecipeStore, SaveOutcome, SaveRequest};
use crate::error::{Error, Result};
use crate::models::{
    Account, HydratedRecipe, Invitation, IssuedSession, RecipeAccess, RecipeForm, RecipeSnapshot,
    RecipeSummary, SessionContext, SharingGroup, Subscription, TeamMember, TeamRole, User,
    normalize_email,
};

/// Session lifetime when the user asked to be remembered.
pub const REMEMBER_ME_DAYS: i64 = 30;
/// Session lifetime otherwise.
pub const SESSION_HOURS: i64 = 12;
pub const INVITATION_DAYS: i64 = 7;

fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn expires_in(duration: Duration) -> String {
    (Utc::now() + duration).to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub struct BrigadeService {
    db: Database,
}

impl BrigadeService {
    pub fn new(db_path: &str) -> Result<Self> {
        let db = Database::open(Path::new(db_path))?;
        Ok(Self { db })
    }

    pub fn new_in_memory() -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self { db })
    }

    // --- Users & sessions ---

    pub fn create_user(&self, email: &str, display_name: &str, restaurant_name: &str) -> Result<User> {
        let email = normalize_email(email).map_err(|e| Error::invalid(e.to_string()))?;
        if self.db.get_user_by_email(&email)?.is_some() {
            return Err(Error::invalid(format!("A user with email '{email}' already exists")));
        }
        let user = self
            .db
            .insert_user(&email, display_name.trim(), restaurant_name.trim())?;
        info!(user_id = user.id, "user created");
        Ok(user)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        Ok(self.db.list_users()?)
    }

    pub fn account(&self, ctx: &SessionContext) -> Result<Account> {
        let user = self
            .db
            .get_user(ctx.user_id)?
            .ok_or_else(|| Error::not_found("User not found"))?;
        let subscription = self.db.get_subscription(ctx.user_id)?;
        Ok(Account { user, subscription })
    }

    /// Issue a bearer token. Only its SHA-256 hash is stored.
    pub fn issue_session(&self, user_id: i64, remember_me: bool) -> Result<IssuedSession> {
        if self.db.get_user(user_id)?.is_none() {
            return Err(Error::not_found(format!("User {user_id} not found")));
        }
        let bytes: [u8; 32] = rand::rng().random();
        let token = hex::encode(bytes);
        let lifetime = if remember_me {
            Duration::days(REMEMBER_ME_DAYS)
        } else {
            Duration::hours(SESSION_HOURS)
        };
        let session =
            self.db
                .insert_session(user_id, &hash_token(&token), remember_me, &expires_in(lifetime))?;
        debug!(user_id, session_id = session.id, remember_me, "session issued");
        Ok(IssuedSession { token, session })
    }

    pub fn issue_session_for_email(&self, email: &str, remember_me: bool) -> Result<IssuedSession> {
        let email = normalize_email(email).map_err(|e| Error::invalid(e.to_string()))?;
        let user = self
            .db
            .get_user_by_email(&email)?
            .ok_or_else(|| Error::not_found(format!("No user with email '{email}'")))?;
        self.issue_session(user.id, remember_me)
    }

    /// Act as a user directly, without a session. Used by the local CLI.
    pub fn context_for_email(&self, email: &str) -> Result<SessionContext> {
        let email = normalize_email(email).map_err(|e| Error::invalid(e.to_string()))?;
        let user = self
            .db
            .get_user_by_email(&email)?
            .ok_or_else(|| Error::not_found(format!("No user with email '{email}'")))?;
        Ok(SessionContext {
            user_id: user.id,
            remember_me: false,
        })
    }

    /// Unknown and expired tokens resolve to `None`.
    pub fn resolve_session(&self, token: &str) -> Result<Option<SessionContext>> {
        let session = self.db.find_session(&hash_token(token), &now_rfc3339())?;
        Ok(session.map(|s| SessionContext {
            user_id: s.user_id,
            remember_me: s.remember_me,
        }))
    }

    pub fn revoke_session(&self, token: &str) -> Result<bool> {
        Ok(self.db.delete_session(&hash_token(token))?)
    }

    pub fn purge_expired_sessions(&self) -> Result<usize> {
        Ok(self.db.delete_expired_sessions(&now_rfc3339())?)
    }

    // --- Recipes ---

    fn require_access(
        &self,
        ctx: &SessionContext,
        recipe_id: i64,
        allowed: fn(RecipeAccess) -> bool,
        action: &str,
    ) -> Result<RecipeAccess> {
        match self.db.recipe_access(ctx.user_id, recipe_id)? {
            None | Some(RecipeAccess::Denied) => {
                Err(Error::not_found(format!("Recipe {recipe_id} not found")))
            }
            Some(access) if allowed(access) => Ok(access),
            Some(_) => Err(Error::forbidden(format!(
                "You do not have permission to {action} recipe {recipe_id}"
            ))),
        }
    }

    pub fn list_recipes(&self, ctx: &SessionContext) -> Result<Vec<RecipeSummary>> {
        Ok(self.db.list_readable_recipes(ctx.user_id)?)
    }

    pub fn load_recipe(&self, ctx: &SessionContext, recipe_id: i64) -> Result<HydratedRecipe> {
        self.require_access(ctx, recipe_id, RecipeAccess::can_read, "view")?;
        editor::load_recipe(&self.db, recipe_id)?
            .ok_or_else(|| Error::not_found(format!("Recipe {recipe_id} not found")))
    }

    /// Save an editable recipe in one transaction. With `snapshot: None` the
    /// rows currently stored for the recipe are replaced. Snapshot ids that do
    /// not belong to the recipe are ignored.
    pub fn save_recipe(
        &self,
        ctx: &SessionContext,
        recipe_id: Option<i64>,
        form: RecipeForm,
        snapshot: Option<RecipeSnapshot>,
    ) -> Result<SaveOutcome> {
        if let Some(id) = recipe_id {
            self.require_access(ctx, id, RecipeAccess::can_write, "edit")?;
        }

        let tx = self.db.begin()?;
        let snapshot = match recipe_id {
            Some(id) => self.scoped_snapshot(id, snapshot)?,
            None => RecipeSnapshot::default(),
        };
        let request = SaveRequest {
            owner_id: ctx.user_id,
            recipe_id,
            form,
            snapshot,
        };
        let outcome = editor::save_recipe(&self.db, &request)?;
        tx.commit().context("Failed to commit recipe save")?;

        info!(
            recipe_id = outcome.recipe_id(),
            user_id = ctx.user_id,
            sections = request.form.sections.len(),
            "recipe saved"
        );
        Ok(outcome)
    }

    fn scoped_snapshot(&self, recipe_id: i64, requested: Option<RecipeSnapshot>) -> Result<RecipeSnapshot> {
        let section_ids: Vec<i64> = self
            .db
            .list_sections(recipe_id)?
            .into_iter()
            .map(|s| s.id)
            .collect();
        let ingredient_ids: Vec<i64> = self
            .db
            .list_ingredients(recipe_id)?
            .into_iter()
            .map(|i| i.id)
            .collect();
        Ok(match requested {
            None => RecipeSnapshot {
                section_ids,
                ingredient_ids,
            },
            Some(snapshot) => RecipeSnapshot {
                section_ids: snapshot
                    .section_ids
                    .into_iter()
                    .filter(|id| section_ids.contains(id))
                    .collect(),
                ingredient_ids: snapshot
                    .ingredient_ids
                    .into_iter()
                    .filter(|id| ingredient_ids.contains(id))
                    .collect(),
            },
        })
    }

    pub fn delete_recipe(&self, ctx: &SessionContext, recipe_id: i64) -> Result<()> {
        self.require_access(ctx, recipe_id, |a| a == RecipeAccess::Owner, "delete")?;
        let tx = self.db.begin()?;
        self.db.delete_recipe(recipe_id)?;
        tx.commit().context("Failed to commit recipe deletion")?;
        info!(recipe_id, user_id = ctx.user_id, "recipe deleted");
        Ok(())
    }

    // --- Team ---

    pub fn invite(&self, ctx: &SessionContext, email: &str, role: TeamRole) -> Result<Invitation> {
        let email = normalize_email(email).map_err(|e| Error::invalid(e.to_string()))?;
        let inviter = self
            .db
            .get_user(ctx.user_id)?
            .ok_or_else(|| Error::not_found("User not found"))?;
        if inviter.email == email {
            return Err(Error::invalid("You cannot invite yourself"));
        }
        let token = Uuid::new_v4().simple().to_string();
        let invitation = self.db.insert_invitation(
            &token,
            ctx.user_id,
            &email,
            role,
            &expires_in(Duration::days(INVITATION_DAYS)),
        )?;
        info!(inviter_id = ctx.user_id, role = role.as_str(), "invitation created");
        Ok(invitation)
    }

    pub fn accept_invitation(&self, ctx: &SessionContext, token: &str) -> Result<TeamMember> {
        let invitation = self
            .db
            .get_invitation(token.trim())?
            .ok_or_else(|| Error::not_found("Invitation not found"))?;
        if invitation.accepted_at.is_some() {
            return Err(Error::invalid("Invitation has already been accepted"));
        }
        if invitation.expires_at <= now_rfc3339() {
            return Err(Error::invalid("Invitation has expired"));
        }
        let user = self
            .db
            .get_user(ctx.user_id)?
            .ok_or_else(|| Error::not_found("User not found"))?;
        if !user.email.eq_ignore_ascii_case(&invitation.email) {
            return Err(Error::forbidden("This invitation was sent to a different email"));
        }
        if invitation.inviter_id == user.id {
            return Err(Error::invalid("You cannot accept your own invitation"));
        }

        let tx = self.db.begin()?;
        self.db
            .upsert_team_member(invitation.inviter_id, user.id, invitation.role)?;
        self.db.mark_invitation_accepted(invitation.id, user.id)?;
        tx.commit().context("Failed to commit invitation acceptance")?;
        info!(
            owner_id = invitation.inviter_id,
            member_id = user.id,
            "invitation accepted"
        );

        self.db
            .list_team(invitation.inviter_id)?
            .into_iter()
            .find(|m| m.member_id == user.id)
            .ok_or_else(|| Error::not_found("Team membership not found"))
    }

    pub fn list_team(&self, ctx: &SessionContext) -> Result<Vec<TeamMember>> {
        Ok(self.db.list_team(ctx.user_id)?)
    }

    pub fn list_invitations(&self, ctx: &SessionContext) -> Result<Vec<Invitation>> {
        Ok(self
            .db
            .list_pending_invitations(ctx.user_id, &now_rfc3339())?)
    }

    pub fn remove_team_member(&self, ctx: &SessionContext, member_id: i64) -> Result<()> {
        if !self.db.remove_team_member(ctx.user_id, member_id)? {
            return Err(Error::not_found(format!("User {member_id} is not on your team")));
        }
        info!(owner_id = ctx.user_id, member_id, "team member removed");
        Ok(())
    }

    // --- Sharing groups ---

    fn group(&self, group_id: i64) -> Result<SharingGroup> {
        self.db
            .get_group(group_id)?
            .ok_or_else(|| Error::not_found(format!("Group {group_id} not found")))
    }

    pub fn create_group(&self, ctx: &SessionContext, name: &str) -> Result<SharingGroup> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::invalid("Group name must not be empty"));
        }
        let tx = self.db.begin()?;
        let group = self.db.insert_group(name, ctx.user_id)?;
        tx.commit().context("Failed to commit group creation")?;
        info!(group_id = group.id, owner_id = ctx.user_id, "group created");
        Ok(group)
    }

    pub fn list_groups(&self, ctx: &SessionContext) -> Result<Vec<SharingGroup>> {
        Ok(self.db.list_groups_for_user(ctx.user_id)?)
    }

    pub fn add_group_member(&self, ctx: &SessionContext, group_id: i64, email: &str) -> Result<SharingGroup> {
        let group = self.group(group_id)?;
        if group.owner_id != ctx.user_id {
            return Err(Error::forbidden("Only the group owner can add members"));
        }
        let email = normalize_email(email).map_err(|e| Error::invalid(e.to_string()))?;
        let user = self
            .db
            .get_user_by_email(&email)?
            .ok_or_else(|| Error::not_found(format!("No user with email '{email}'")))?;
        if self.db.add_group_member(group_id, user.id)? {
            info!(group_id, member_id = user.id, "group member added");
        }
        self.group(group_id)
    }

    pub fn share_recipe(&self, ctx: &SessionContext, group_id: i64, recipe_id: i64) -> Result<SharingGroup> {
        self.group(group_id)?;
        if !self.db.is_group_member(group_id, ctx.user_id)? {
            return Err(Error::forbidden("You are not a member of this group"));
        }
        self.require_access(ctx, recipe_id, RecipeAccess::can_write, "share")?;
        if self.db.share_recipe(group_id, recipe_id, ctx.user_id)? {
            info!(group_id, recipe_id, "recipe shared");
        }
        self.group(group_id)
    }

    pub fn unshare_recipe(&self, ctx: &SessionContext, group_id: i64, recipe_id: i64) -> Result<()> {
        let group = self.group(group_id)?;
        let sharer = self
            .db
            .recipe_sharer(group_id, recipe_id)?
            .ok_or_else(|| Error::not_found("Recipe is not shared in this group"))?;
        if ctx.user_id != group.owner_id && ctx.user_id != sharer {
            return Err(Error::forbidden(
                "Only the group owner or the user who shared it can unshare a recipe",
            ));
        }
        self.db.unshare_recipe(group_id, recipe_id)?;
        info!(group_id, recipe_id, "recipe unshared");
        Ok(())
    }

    // --- Billing ---

    pub fn subscription(&self, ctx: &SessionContext) -> Result<Option<Subscription>> {
        Ok(self.db.get_subscription(ctx.user_id)?)
    }

    /// Apply a verified webhook event. Returns whether a subscription changed.
    pub fn apply_billing_event(&self, event: &BillingEvent) -> Result<bool> {
        let Some(status) = event.status() else {
            if let BillingEvent::Ignored { event_type } = event {
                debug!(event_type = %event_type, "ignoring billing event");
            }
            return Ok(false);
        };

        let applied = match event {
            BillingEvent::CheckoutCompleted {
                user_id,
                customer_id,
                subscription_id,
            } => {
                if self.db.get_user(*user_id)?.is_none() {
                    warn!(user_id, "checkout completed for unknown user");
                    return Ok(false);
                }
                self.db.upsert_subscription(
                    *user_id,
                    customer_id,
                    subscription_id.as_deref(),
                    status,
                )?;
                true
            }
            BillingEvent::SubscriptionUpdated {
                customer_id,
                subscription_id,
                current_period_end,
                ..
            } => self.db.update_subscription_status(
                customer_id,
                status,
                Some(subscription_id.as_str()),
                current_period_end.as_deref(),
            )?,
            BillingEvent::SubscriptionDeleted {
                customer_id,
                subscription_id,
            } => self.db.update_subscription_status(
                customer_id,
                status,
                Some(subscription_id.as_str()),
                None,
            )?,
            BillingEvent::InvoicePaid {
                customer_id,
                subscription_id,
            } => self.db.update_subscription_status(
                customer_id,
                status,
                subscription_id.as_deref(),
                None,
            )?,
            BillingEvent::InvoicePaymentFailed { customer_id } => {
                self.db
                    .update_subscription_status(customer_id, status, None, None)?
            }
            BillingEvent::Ignored { .. } => false,
        };

        if applied {
            info!(status = status.as_str(), "subscription updated");
        } else {
            warn!(?event, "billing event for unknown customer");
        }
        Ok(applied)
    }
}
