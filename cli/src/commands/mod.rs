mod helpers;
mod recipe;
mod team;
mod user;

pub(crate) use recipe::{cmd_recipe_delete, cmd_recipe_import, cmd_recipe_list, cmd_recipe_show};
pub(crate) use team::{cmd_team_accept, cmd_team_invite, cmd_team_list};
pub(crate) use user::{cmd_user_add, cmd_user_list, cmd_user_revoke, cmd_user_token};
