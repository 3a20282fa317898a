//! Recipe editor persistence: the replace-all save and its paired hydration.
//!
//! A save never diffs. It writes a fresh set of section, ingredient and link
//! rows for the recipe, then deletes the rows listed in the pre-edit snapshot.
//! The routine is generic over [`RecipeStore`] and does not wrap itself in a
//! transaction; callers that have one (see `BrigadeService::save_recipe`) run
//! it inside it.

use std::collections::HashMap;
use std::fmt;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{
    FormIngredient, FormSection, HydratedRecipe, Ingredient, NewIngredient, NewSection,
    NewSectionIngredient, Recipe, RecipeFields, RecipeForm, RecipeSnapshot, Section,
    SectionIngredient, normalize_recipe_fields,
};

/// Row-level storage the editor reads and writes.
///
/// Bulk inserts must preserve input order: `insert_sections` echoes every row
/// with its `order_index`, `insert_ingredients` returns ids in staged order.
pub trait RecipeStore {
    fn insert_recipe(&self, owner_id: i64, fields: &RecipeFields) -> Result<i64>;
    fn update_recipe(&self, recipe_id: i64, fields: &RecipeFields) -> Result<()>;
    fn insert_sections(&self, rows: &[NewSection]) -> Result<Vec<Section>>;
    fn insert_ingredients(&self, rows: &[NewIngredient]) -> Result<Vec<i64>>;
    fn insert_links(&self, rows: &[NewSectionIngredient]) -> Result<()>;
    fn delete_links_for_sections(&self, section_ids: &[i64]) -> Result<()>;
    fn delete_sections(&self, section_ids: &[i64]) -> Result<()>;
    fn delete_ingredients(&self, ingredient_ids: &[i64]) -> Result<()>;

    fn get_recipe(&self, recipe_id: i64) -> Result<Option<Recipe>>;
    fn list_sections(&self, recipe_id: i64) -> Result<Vec<Section>>;
    fn list_ingredients(&self, recipe_id: i64) -> Result<Vec<Ingredient>>;
    fn list_links(&self, recipe_id: i64) -> Result<Vec<SectionIngredient>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStep {
    UpsertRecipe,
    InsertSections,
    InsertIngredients,
    InsertLinks,
    DeleteLinks,
    DeleteSections,
    DeleteIngredients,
}

impl fmt::Display for SaveStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::UpsertRecipe => "saving recipe",
            Self::InsertSections => "inserting sections",
            Self::InsertIngredients => "inserting ingredients",
            Self::InsertLinks => "linking ingredients to sections",
            Self::DeleteLinks => "deleting previous ingredient links",
            Self::DeleteSections => "deleting previous sections",
            Self::DeleteIngredients => "deleting previous ingredients",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EditorError {
    /// Rejected before any store call.
    #[error("{0}")]
    Validation(String),
    /// One of the write steps failed; later steps did not run.
    #[error("Failed {step}: {source:#}")]
    Step {
        step: SaveStep,
        #[source]
        source: anyhow::Error,
    },
    /// The new rows are in place but the previous ones were not fully removed.
    #[error("Recipe {recipe_id} saved, but failed {step}: {source:#}")]
    Cleanup {
        recipe_id: i64,
        step: SaveStep,
        #[source]
        source: anyhow::Error,
    },
}

impl EditorError {
    fn step(step: SaveStep) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::Step { step, source }
    }

    fn cleanup(recipe_id: i64, step: SaveStep) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| Self::Cleanup {
            recipe_id,
            step,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "recipe_id", rename_all = "snake_case")]
pub enum SaveOutcome {
    Created(i64),
    Saved(i64),
}

impl SaveOutcome {
    #[must_use]
    pub fn recipe_id(self) -> i64 {
        match self {
            Self::Created(id) | Self::Saved(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SaveRequest {
    pub owner_id: i64,
    /// `None` creates a new recipe.
    pub recipe_id: Option<i64>,
    pub form: RecipeForm,
    pub snapshot: RecipeSnapshot,
}

// A link whose ids are still positions in the staged batches.
struct PendingLink {
    section_index: i64,
    ingredient_position: usize,
    order_index: i64,
}

/// Persist an editable recipe, replacing every section, ingredient and link
/// listed in the request's snapshot.
pub fn save_recipe<S: RecipeStore + ?Sized>(
    store: &S,
    request: &SaveRequest,
) -> Result<SaveOutcome, EditorError> {
    let fields = normalize_recipe_fields(&request.form)
        .map_err(|e| EditorError::Validation(e.to_string()))?;

    let recipe_id = match request.recipe_id {
        Some(id) => {
            store
                .update_recipe(id, &fields)
                .map_err(EditorError::step(SaveStep::UpsertRecipe))?;
            id
        }
        None => store
            .insert_recipe(request.owner_id, &fields)
            .map_err(EditorError::step(SaveStep::UpsertRecipe))?,
    };
    debug!(recipe_id, title = %fields.title, "recipe row written");

    let section_rows = stage_sections(recipe_id, &request.form.sections);
    let section_ids: HashMap<i64, i64> = if section_rows.is_empty() {
        HashMap::new()
    } else {
        store
            .insert_sections(&section_rows)
            .map_err(EditorError::step(SaveStep::InsertSections))?
            .into_iter()
            .map(|s| (s.order_index, s.id))
            .collect()
    };
    debug!(recipe_id, count = section_rows.len(), "sections inserted");

    let (ingredient_rows, pending) = stage_ingredients(recipe_id, &request.form.sections);
    let ingredient_ids = if ingredient_rows.is_empty() {
        Vec::new()
    } else {
        store
            .insert_ingredients(&ingredient_rows)
            .map_err(EditorError::step(SaveStep::InsertIngredients))?
    };
    debug!(recipe_id, count = ingredient_ids.len(), "ingredients inserted");

    let links: Vec<NewSectionIngredient> = pending
        .iter()
        .filter_map(|p| {
            Some(NewSectionIngredient {
                section_id: *section_ids.get(&p.section_index)?,
                ingredient_id: *ingredient_ids.get(p.ingredient_position)?,
                order_index: p.order_index,
            })
        })
        .collect();
    if links.len() < pending.len() {
        warn!(
            recipe_id,
            dropped = pending.len() - links.len(),
            "dropping ingredient links with unresolved ids"
        );
    }
    if !links.is_empty() {
        store
            .insert_links(&links)
            .map_err(EditorError::step(SaveStep::InsertLinks))?;
    }
    debug!(recipe_id, count = links.len(), "links inserted");

    remove_previous_rows(store, recipe_id, &request.snapshot).inspect_err(|e| {
        warn!(recipe_id, error = %e, "cleanup of previous recipe rows failed");
    })?;

    Ok(match request.recipe_id {
        Some(_) => SaveOutcome::Saved(recipe_id),
        None => SaveOutcome::Created(recipe_id),
    })
}

fn stage_sections(recipe_id: i64, sections: &[FormSection]) -> Vec<NewSection> {
    sections
        .iter()
        .zip(0_i64..)
        .map(|(section, order_index)| NewSection {
            recipe_id,
            title: section.title.trim().to_string(),
            instructions: section.instructions.clone(),
            order_index,
        })
        .collect()
}

fn stage_ingredients(
    recipe_id: i64,
    sections: &[FormSection],
) -> (Vec<NewIngredient>, Vec<PendingLink>) {
    let mut rows = Vec::new();
    let mut pending = Vec::new();
    for (section, section_index) in sections.iter().zip(0_i64..) {
        let kept = section.ingredients.iter().filter(|i| !i.is_blank());
        for (ingredient, order_in_section) in kept.zip(0_i64..) {
            let position = rows.len();
            pending.push(PendingLink {
                section_index,
                ingredient_position: position,
                order_index: order_in_section,
            });
            rows.push(NewIngredient {
                recipe_id,
                quantity: ingredient.quantity,
                unit: ingredient.unit.trim().to_string(),
                designation: ingredient.designation.trim().to_string(),
                order_index: i64::try_from(position).unwrap_or(i64::MAX),
            });
        }
    }
    (rows, pending)
}

// Links go first so no section or ingredient is deleted while still referenced.
fn remove_previous_rows<S: RecipeStore + ?Sized>(
    store: &S,
    recipe_id: i64,
    snapshot: &RecipeSnapshot,
) -> Result<(), EditorError> {
    if !snapshot.section_ids.is_empty() {
        store
            .delete_links_for_sections(&snapshot.section_ids)
            .map_err(EditorError::cleanup(recipe_id, SaveStep::DeleteLinks))?;
        store
            .delete_sections(&snapshot.section_ids)
            .map_err(EditorError::cleanup(recipe_id, SaveStep::DeleteSections))?;
    }
    if !snapshot.ingredient_ids.is_empty() {
        store
            .delete_ingredients(&snapshot.ingredient_ids)
            .map_err(EditorError::cleanup(recipe_id, SaveStep::DeleteIngredients))?;
    }
    debug!(
        recipe_id,
        sections = snapshot.section_ids.len(),
        ingredients = snapshot.ingredient_ids.len(),
        "previous rows removed"
    );
    Ok(())
}

/// Rebuild the editable form of a stored recipe. Returns `None` when the
/// recipe does not exist.
pub fn load_recipe<S: RecipeStore + ?Sized>(
    store: &S,
    recipe_id: i64,
) -> Result<Option<HydratedRecipe>> {
    let Some(recipe) = store.get_recipe(recipe_id)? else {
        return Ok(None);
    };
    let sections = store.list_sections(recipe_id)?;
    let ingredients = store.list_ingredients(recipe_id)?;
    let links = store.list_links(recipe_id)?;

    let by_id: HashMap<i64, &Ingredient> = ingredients.iter().map(|i| (i.id, i)).collect();

    let form_sections = sections
        .iter()
        .map(|section| {
            let mut rows: Vec<FormIngredient> = links
                .iter()
                .filter(|link| link.section_id == section.id)
                .filter_map(|link| by_id.get(&link.ingredient_id))
                .map(|ingredient| FormIngredient {
                    local_id: format!("ingredient-{}", ingredient.id),
                    quantity: ingredient.quantity,
                    unit: ingredient.unit.clone(),
                    designation: ingredient.designation.clone(),
                })
                .collect();
            if rows.is_empty() {
                rows.push(FormIngredient::blank(format!("section-{}-blank", section.id)));
            }
            FormSection {
                local_id: format!("section-{}", section.id),
                title: section.title.clone(),
                instructions: section.instructions.clone(),
                ingredients: rows,
            }
        })
        .collect();

    Ok(Some(HydratedRecipe {
        recipe_id: recipe.id,
        owner_id: recipe.owner_id,
        form: RecipeForm {
            title: recipe.title,
            servings: recipe.servings,
            category: recipe.category,
            notes: recipe.notes,
            sections: form_sections,
        },
        snapshot: RecipeSnapshot {
            section_ids: sections.iter().map(|s| s.id).collect(),
            ingredient_ids: ingredients.iter().map(|i| i.id).collect(),
        },
    }))
}
