use anyhow::Result;
use std::process;
use tabled::{Table, Tabled, settings::Style};

use brigade_core::service::BrigadeService;

use super::helpers::{exit_empty, json_error, print_json, short_timestamp, truncate};

pub(crate) fn cmd_user_add(
    service: &BrigadeService,
    email: &str,
    name: &str,
    restaurant: &str,
    json: bool,
) -> Result<()> {
    let user = service.create_user(email, name, restaurant)?;
    if json {
        return print_json(&user);
    }
    let id = user.id;
    let email = &user.email;
    println!("Created user {email} (id: {id})");
    println!("Issue an API token with: brigade user token {email}");
    Ok(())
}

pub(crate) fn cmd_user_list(service: &BrigadeService, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct UserRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Email")]
        email: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Restaurant")]
        restaurant: String,
        #[tabled(rename = "Created")]
        created: String,
    }

    let users = service.list_users()?;
    if users.is_empty() {
        exit_empty("users", json);
    }
    if json {
        return print_json(&users);
    }

    let rows: Vec<UserRow> = users
        .iter()
        .map(|u| UserRow {
            id: u.id,
            email: u.email.clone(),
            name: truncate(&u.display_name, 24),
            restaurant: truncate(&u.restaurant_name, 24),
            created: short_timestamp(&u.created_at),
        })
        .collect();
    println!("{}", Table::new(&rows).with(Style::rounded()));
    Ok(())
}

pub(crate) fn cmd_user_token(
    service: &BrigadeService,
    email: &str,
    remember_me: bool,
    json: bool,
) -> Result<()> {
    let issued = service.issue_session_for_email(email, remember_me)?;
    if json {
        return print_json(&issued);
    }
    let token = &issued.token;
    let expires = short_timestamp(&issued.session.expires_at);
    println!("{token}");
    eprintln!("Expires {expires}. Send as: Authorization: Bearer <token>");
    Ok(())
}

pub(crate) fn cmd_user_revoke(service: &BrigadeService, token: &str, json: bool) -> Result<()> {
    if service.revoke_session(token.trim())? {
        if json {
            println!("{}", serde_json::json!({ "revoked": true }));
        } else {
            println!("Session revoked");
        }
        return Ok(());
    }
    if json {
        println!("{}", json_error("No session for that token"));
    } else {
        eprintln!("No session for that token");
    }
    process::exit(2);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_add_creates_user() {
        let service = BrigadeService::new_in_memory().unwrap();
        cmd_user_add(&service, "Chef@Bistro.fr", "Chef", "Bistro", false).unwrap();
        cmd_user_list(&service, true).unwrap();

        let users = service.list_users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, "chef@bistro.fr");
        assert_eq!(users[0].restaurant_name, "Bistro");
    }

    #[test]
    fn test_user_add_rejects_duplicate_email() {
        let service = BrigadeService::new_in_memory().unwrap();
        cmd_user_add(&service, "chef@bistro.fr", "", "", true).unwrap();
        assert!(cmd_user_add(&service, "CHEF@bistro.fr", "", "", true).is_err());
        assert!(cmd_user_add(&service, "not-an-email", "", "", true).is_err());
    }

    #[test]
    fn test_user_token_requires_known_email() {
        let service = BrigadeService::new_in_memory().unwrap();
        assert!(cmd_user_token(&service, "ghost@bistro.fr", false, true).is_err());

        service.create_user("chef@bistro.fr", "", "").unwrap();
        cmd_user_token(&service, "chef@bistro.fr", true, true).unwrap();
    }

    #[test]
    fn test_user_revoke_ends_session() {
        let service = BrigadeService::new_in_memory().unwrap();
        let user = service.create_user("chef@bistro.fr", "", "").unwrap();
        let token = service.issue_session(user.id, false).unwrap().token;
        assert!(service.resolve_session(&token).unwrap().is_some());

        cmd_user_revoke(&service, &format!(" {token}\n"), false).unwrap();
        assert!(service.resolve_session(&token).unwrap().is_none());
    }
}
