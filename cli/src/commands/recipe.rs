use anyhow::{Context, Result};
use std::path::Path;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use brigade_core::import::UploadedFile;
use brigade_core::models::{HydratedRecipe, RecipeForm};
use brigade_core::service::BrigadeService;

use crate::importer::Importer;

use super::helpers::{acting_as, exit_empty, format_quantity, print_json, short_timestamp, truncate};

pub(crate) fn cmd_recipe_list(service: &BrigadeService, user: &str, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct RecipeRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Title")]
        title: String,
        #[tabled(rename = "Category")]
        category: String,
        #[tabled(rename = "Serves")]
        servings: i64,
        #[tabled(rename = "Sections")]
        sections: i64,
        #[tabled(rename = "Ingredients")]
        ingredients: i64,
        #[tabled(rename = "Access")]
        access: String,
        #[tabled(rename = "Updated")]
        updated: String,
    }

    let ctx = acting_as(service, user)?;
    let recipes = service.list_recipes(&ctx)?;
    if recipes.is_empty() {
        exit_empty("recipes", json);
    }
    if json {
        return print_json(&recipes);
    }

    let rows: Vec<RecipeRow> = recipes
        .iter()
        .map(|r| RecipeRow {
            id: r.id,
            title: truncate(&r.title, 32),
            category: r.category.clone(),
            servings: r.servings,
            sections: r.section_count,
            ingredients: r.ingredient_count,
            access: r.access.clone(),
            updated: short_timestamp(&r.updated_at),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(3..6)).with(Alignment::right()))
        .to_string();
    println!("{table}");
    Ok(())
}

fn print_form(form: &RecipeForm, heading: &str) {
    let title = &form.title;
    let servings = form.servings;
    println!("=== {title} === {heading}");
    println!("  Serves {servings}");
    if !form.category.trim().is_empty() {
        println!("  Category: {}", form.category);
    }

    for section in &form.sections {
        let name = if section.title.trim().is_empty() {
            "(untitled section)"
        } else {
            section.title.as_str()
        };
        println!("\n  {name}");
        for ingredient in section.ingredients.iter().filter(|i| !i.is_blank()) {
            let qty = format_quantity(ingredient.quantity);
            let line = [qty.as_str(), ingredient.unit.trim(), ingredient.designation.trim()]
                .iter()
                .filter(|part| !part.is_empty())
                .copied()
                .collect::<Vec<_>>()
                .join(" ");
            println!("    - {line}");
        }
        if !section.instructions.trim().is_empty() {
            for step in section.instructions.lines() {
                println!("    {step}");
            }
        }
    }

    if !form.notes.trim().is_empty() {
        println!("\n  NOTES:");
        for line in form.notes.lines() {
            println!("    {line}");
        }
    }
}

fn print_recipe(recipe: &HydratedRecipe) {
    print_form(&recipe.form, &format!("(id: {})", recipe.recipe_id));
}

pub(crate) fn cmd_recipe_show(
    service: &BrigadeService,
    user: &str,
    recipe_id: i64,
    json: bool,
) -> Result<()> {
    let ctx = acting_as(service, user)?;
    let recipe = service.load_recipe(&ctx, recipe_id)?;
    if json {
        return print_json(&recipe);
    }
    print_recipe(&recipe);
    Ok(())
}

pub(crate) async fn cmd_recipe_import(
    service: &BrigadeService,
    importer: &Importer,
    user: &str,
    file: &Path,
    save: bool,
    json: bool,
) -> Result<()> {
    let ctx = acting_as(service, user)?;
    let data = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let form = importer
        .import(UploadedFile {
            filename,
            content_type: None,
            data,
        })
        .await?;

    if !save {
        if json {
            return print_json(&form);
        }
        print_form(&form, "(draft, not saved)");
        eprintln!("\nRe-run with --save to store it.");
        return Ok(());
    }

    let outcome = service.save_recipe(&ctx, None, form, None)?;
    let recipe = service.load_recipe(&ctx, outcome.recipe_id())?;
    if json {
        return print_json(&recipe);
    }
    print_recipe(&recipe);
    Ok(())
}

pub(crate) fn cmd_recipe_delete(
    service: &BrigadeService,
    user: &str,
    recipe_id: i64,
    json: bool,
) -> Result<()> {
    let ctx = acting_as(service, user)?;
    service.delete_recipe(&ctx, recipe_id)?;
    if json {
        println!("{}", serde_json::json!({ "deleted": recipe_id }));
    } else {
        println!("Deleted recipe {recipe_id}");
    }
    Ok(())
}
