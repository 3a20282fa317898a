use anyhow::{Result, bail};
use serde::{Deserialize, Deserializer, Serialize};

/// Category stored when the form leaves it empty.
pub const DEFAULT_CATEGORY: &str = "other";

/// Title given to an imported recipe when the document yields none.
pub const DEFAULT_IMPORT_TITLE: &str = "Imported recipe";

#[derive(Debug, Clone, Serialize)]
pub struct Recipe {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
    pub servings: i64,
    pub category: String,
    pub notes: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Section {
    pub id: i64,
    pub recipe_id: i64,
    pub title: String,
    pub instructions: String,
    pub order_index: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Ingredient {
    pub id: i64,
    pub recipe_id: i64,
    pub quantity: Option<f64>,
    pub unit: String,
    pub designation: String,
    pub order_index: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SectionIngredient {
    pub id: i64,
    pub section_id: i64,
    pub ingredient_id: i64,
    pub order_index: i64,
}

/// Normalised recipe row values, ready to insert or update.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipeFields {
    pub title: String,
    pub servings: i64,
    pub category: String,
    pub notes: String,
}

#[derive(Debug, Clone)]
pub struct NewSection {
    pub recipe_id: i64,
    pub title: String,
    pub instructions: String,
    pub order_index: i64,
}

#[derive(Debug, Clone)]
pub struct NewIngredient {
    pub recipe_id: i64,
    pub quantity: Option<f64>,
    pub unit: String,
    pub designation: String,
    pub order_index: i64,
}

#[derive(Debug, Clone)]
pub struct NewSectionIngredient {
    pub section_id: i64,
    pub ingredient_id: i64,
    pub order_index: i64,
}

// --- Editable form ---

/// The editable shape of a recipe, as the editor holds it between loads and saves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeForm {
    pub title: String,
    #[serde(default = "default_servings", deserialize_with = "deserialize_servings")]
    pub servings: i64,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub sections: Vec<FormSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormSection {
    #[serde(default)]
    pub local_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub ingredients: Vec<FormIngredient>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormIngredient {
    #[serde(default)]
    pub local_id: String,
    #[serde(default, deserialize_with = "deserialize_quantity")]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub designation: String,
}

impl FormIngredient {
    #[must_use]
    pub fn blank(local_id: String) -> Self {
        Self {
            local_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.designation.trim().is_empty()
    }
}

/// Section and ingredient ids captured when an edit session began.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeSnapshot {
    #[serde(default)]
    pub section_ids: Vec<i64>,
    #[serde(default)]
    pub ingredient_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HydratedRecipe {
    pub recipe_id: i64,
    pub owner_id: i64,
    pub form: RecipeForm,
    pub snapshot: RecipeSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeSummary {
    pub id: i64,
    pub owner_id: i64,
    pub title: String,
    pub servings: i64,
    pub category: String,
    pub section_count: i64,
    pub ingredient_count: i64,
    pub access: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeAccess {
    Owner,
    Editor,
    Viewer,
    Shared,
    Denied,
}

impl RecipeAccess {
    #[must_use]
    pub fn can_read(self) -> bool {
        !matches!(self, Self::Denied)
    }

    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, Self::Owner | Self::Editor)
    }
}

// --- Users & sessions ---

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub display_name: String,
    pub restaurant_name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: i64,
    pub user_id: i64,
    pub remember_me: bool,
    pub created_at: String,
    pub expires_at: String,
}

/// The authenticated caller, passed explicitly to every operation that needs one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub user_id: i64,
    pub remember_me: bool,
}

/// A freshly issued session. The token is only ever returned here.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedSession {
    pub token: String,
    pub session: Session,
}

// --- Teams ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Editor,
    Viewer,
}

impl TeamRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }

    pub fn parse(role: &str) -> Result<Self> {
        match role.trim().to_lowercase().as_str() {
            "editor" => Ok(Self::Editor),
            "viewer" => Ok(Self::Viewer),
            _ => bail!("Invalid role '{role}'. Must be one of: editor, viewer"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TeamMember {
    pub owner_id: i64,
    pub member_id: i64,
    pub email: String,
    pub display_name: String,
    pub role: TeamRole,
    pub joined_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Invitation {
    pub id: i64,
    pub token: String,
    pub inviter_id: i64,
    pub email: String,
    pub role: TeamRole,
    pub created_at: String,
    pub expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_by: Option<i64>,
}

// --- Sharing groups ---

#[derive(Debug, Clone, Serialize)]
pub struct SharingGroup {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    pub created_at: String,
    pub member_count: i64,
    pub recipe_count: i64,
}

// --- Billing ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
}

impl SubscriptionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
        }
    }

    pub fn parse(status: &str) -> Result<Self> {
        Ok(match status {
            "active" => Self::Active,
            "trialing" => Self::Trialing,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "unpaid" => Self::Unpaid,
            "paused" => Self::Paused,
            other => bail!("Unknown subscription status '{other}'"),
        })
    }

    /// Whether the subscription currently grants paid features.
    #[must_use]
    pub fn is_entitled(self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub user_id: i64,
    pub customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<String>,
    pub updated_at: String,
}

/// The current user as `GET /api/me` reports it.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub user: User,
    pub subscription: Option<Subscription>,
}

// --- Normalisation & validation ---

/// Trim the title, clamp servings, and default the category.
pub fn normalize_recipe_fields(form: &RecipeForm) -> Result<RecipeFields> {
    let title = form.title.trim();
    if title.is_empty() {
        bail!("Recipe title must not be empty");
    }
    let category = form.category.trim();
    Ok(RecipeFields {
        title: title.to_string(),
        servings: form.servings.max(1),
        category: if category.is_empty() {
            DEFAULT_CATEGORY.to_string()
        } else {
            category.to_string()
        },
        notes: form.notes.clone(),
    })
}

/// Lowercase and validate an email address.
pub fn normalize_email(email: &str) -> Result<String> {
    let email = email.trim().to_lowercase();
    if email.chars().any(char::is_whitespace) {
        bail!("Invalid email '{email}': must not contain whitespace");
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() && !domain.contains('@') => {
            Ok(email)
        }
        _ => bail!("Invalid email '{email}'"),
    }
}

/// Parse a quantity the way the editor accepts it: `"1,5"`, `"1.5"`, `""`.
#[must_use]
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.replace(',', ".").parse::<f64>().ok().filter(|q| q.is_finite())
}

/// Leading whole number of a servings text such as `"6 personnes"` or `"-3"`.
/// A `-` directly before the digits keeps the value negative so it clamps
/// like any other count below 1.
#[must_use]
pub fn parse_servings(raw: &str) -> Option<i64> {
    let start = raw.find(|c: char| c.is_ascii_digit())?;
    let digits = raw[start..]
        .split(|c: char| !c.is_ascii_digit())
        .next()?;
    let value: i64 = digits.parse().ok()?;
    Some(if raw[..start].ends_with('-') {
        -value
    } else {
        value
    })
}

fn default_servings() -> i64 {
    1
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Int(i64),
    Float(f64),
    Text(String),
}

fn deserialize_quantity<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[allow(clippy::cast_precision_loss)]
    let value = Option::<NumberOrText>::deserialize(deserializer)?.and_then(|v| match v {
        NumberOrText::Int(n) => Some(n as f64),
        NumberOrText::Float(f) => Some(f),
        NumberOrText::Text(s) => parse_quantity(&s),
    });
    Ok(value)
}

fn deserialize_servings<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[allow(clippy::cast_possible_truncation)]
    let value = Option::<NumberOrText>::deserialize(deserializer)?.and_then(|v| match v {
        NumberOrText::Int(n) => Some(n),
        NumberOrText::Float(f) => Some(f.round() as i64),
        NumberOrText::Text(s) => parse_servings(&s),
    });
    Ok(value.unwrap_or(1).max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(title: &str, servings: i64, category: &str) -> RecipeForm {
        RecipeForm {
            title: title.to_string(),
            servings,
            category: category.to_string(),
            notes: String::new(),
            sections: Vec::new(),
        }
    }

    #[test]
    fn test_normalize_trims_title() {
        let fields = normalize_recipe_fields(&form("  Tarte  ", 4, "dessert")).unwrap();
        assert_eq!(fields.title, "Tarte");
        assert_eq!(fields.category, "dessert");
    }

    #[test]
    fn test_normalize_rejects_blank_title() {
        assert!(normalize_recipe_fields(&form("   ", 4, "")).is_err());
        assert!(normalize_recipe_fields(&form("", 4, "")).is_err());
    }

    #[test]
    fn test_normalize_clamps_servings() {
        assert_eq!(normalize_recipe_fields(&form("Soupe", 0, "")).unwrap().servings, 1);
        assert_eq!(normalize_recipe_fields(&form("Soupe", -3, "")).unwrap().servings, 1);
        assert_eq!(normalize_recipe_fields(&form("Soupe", 6, "")).unwrap().servings, 6);
    }

    #[test]
    fn test_normalize_defaults_category() {
        let fields = normalize_recipe_fields(&form("Soupe", 2, "  ")).unwrap();
        assert_eq!(fields.category, DEFAULT_CATEGORY);
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("200"), Some(200.0));
        assert_eq!(parse_quantity("1,5"), Some(1.5));
        assert_eq!(parse_quantity(" 0.25 "), Some(0.25));
        assert_eq!(parse_quantity(""), None);
        assert_eq!(parse_quantity("a pinch"), None);
    }

    #[test]
    fn test_form_ingredient_accepts_string_or_number_quantity() {
        let json = r#"[
            {"quantity": 200, "unit": "g", "designation": "farine"},
            {"quantity": "1,5", "unit": "l", "designation": "lait"},
            {"quantity": "", "unit": "g", "designation": ""},
            {"quantity": null, "designation": "sel"},
            {"designation": "poivre"}
        ]"#;
        let rows: Vec<FormIngredient> = serde_json::from_str(json).unwrap();
        assert_eq!(rows[0].quantity, Some(200.0));
        assert_eq!(rows[1].quantity, Some(1.5));
        assert_eq!(rows[2].quantity, None);
        assert!(rows[2].is_blank());
        assert_eq!(rows[3].quantity, None);
        assert_eq!(rows[4].unit, "");
    }

    #[test]
    fn test_form_servings_lenient() {
        let f: RecipeForm = serde_json::from_str(r#"{"title": "A", "servings": "6 personnes"}"#).unwrap();
        assert_eq!(f.servings, 6);
        let f: RecipeForm = serde_json::from_str(r#"{"title": "A"}"#).unwrap();
        assert_eq!(f.servings, 1);
        let f: RecipeForm = serde_json::from_str(r#"{"title": "A", "servings": 4.0}"#).unwrap();
        assert_eq!(f.servings, 4);
    }

    #[test]
    fn test_negative_servings_clamp_to_one() {
        let f: RecipeForm = serde_json::from_str(r#"{"title": "A", "servings": "-3"}"#).unwrap();
        assert_eq!(f.servings, 1);
        let f: RecipeForm = serde_json::from_str(r#"{"title": "A", "servings": -2}"#).unwrap();
        assert_eq!(f.servings, 1);
    }

    #[test]
    fn test_parse_servings() {
        assert_eq!(parse_servings("6 personnes"), Some(6));
        assert_eq!(parse_servings("pour 4"), Some(4));
        assert_eq!(parse_servings("-3"), Some(-3));
        assert_eq!(parse_servings(" +2 "), Some(2));
        assert_eq!(parse_servings("4-6"), Some(4));
        assert_eq!(parse_servings("several"), None);
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email(" Chef@Bistro.FR ").unwrap(), "chef@bistro.fr");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@bistro.fr").is_err());
        assert!(normalize_email("chef@").is_err());
        assert!(normalize_email("a b@bistro.fr").is_err());
        assert!(normalize_email("a@b@c").is_err());
    }

    #[test]
    fn test_team_role_parse() {
        assert_eq!(TeamRole::parse("Editor").unwrap(), TeamRole::Editor);
        assert_eq!(TeamRole::parse("viewer").unwrap(), TeamRole::Viewer);
        assert!(TeamRole::parse("admin").is_err());
    }

    #[test]
    fn test_subscription_status_roundtrip_names() {
        for status in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::IncompleteExpired,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(SubscriptionStatus::parse("bogus").is_err());
        assert!(SubscriptionStatus::Trialing.is_entitled());
        assert!(!SubscriptionStatus::PastDue.is_entitled());
    }

    #[test]
    fn test_recipe_access_rules() {
        assert!(RecipeAccess::Owner.can_write());
        assert!(RecipeAccess::Editor.can_write());
        assert!(!RecipeAccess::Viewer.can_write());
        assert!(RecipeAccess::Shared.can_read());
        assert!(!RecipeAccess::Shared.can_write());
        assert!(!RecipeAccess::Denied.can_read());
    }
}
