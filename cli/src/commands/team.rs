use anyhow::Result;
use tabled::{Table, Tabled, settings::Style};

use brigade_core::models::TeamRole;
use brigade_core::service::BrigadeService;

use super::helpers::{acting_as, exit_empty, print_json, short_timestamp};

pub(crate) fn cmd_team_invite(
    service: &BrigadeService,
    user: &str,
    email: &str,
    role: &str,
    json: bool,
) -> Result<()> {
    let ctx = acting_as(service, user)?;
    let role = TeamRole::parse(role)?;
    let invitation = service.invite(&ctx, email, role)?;
    if json {
        return print_json(&invitation);
    }
    let token = &invitation.token;
    let expires = short_timestamp(&invitation.expires_at);
    println!("Invited {} as {} (expires {expires})", invitation.email, role.as_str());
    println!("They accept with: brigade team accept {token} --user {}", invitation.email);
    Ok(())
}

pub(crate) fn cmd_team_accept(
    service: &BrigadeService,
    user: &str,
    token: &str,
    json: bool,
) -> Result<()> {
    let ctx = acting_as(service, user)?;
    let member = service.accept_invitation(&ctx, token)?;
    if json {
        return print_json(&member);
    }
    println!(
        "Joined team of user {} as {}",
        member.owner_id,
        member.role.as_str()
    );
    Ok(())
}

pub(crate) fn cmd_team_list(service: &BrigadeService, user: &str, json: bool) -> Result<()> {
    #[derive(Tabled)]
    struct MemberRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Email")]
        email: String,
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "Role")]
        role: &'static str,
        #[tabled(rename = "Joined")]
        joined: String,
    }

    let ctx = acting_as(service, user)?;
    let members = service.list_team(&ctx)?;
    let invitations = service.list_invitations(&ctx)?;
    if members.is_empty() && invitations.is_empty() {
        exit_empty("team members", json);
    }
    if json {
        return print_json(&serde_json::json!({
            "members": members,
            "invitations": invitations,
        }));
    }

    if !members.is_empty() {
        let rows: Vec<MemberRow> = members
            .iter()
            .map(|m| MemberRow {
                id: m.member_id,
                email: m.email.clone(),
                name: m.display_name.clone(),
                role: m.role.as_str(),
                joined: short_timestamp(&m.joined_at),
            })
            .collect();
        println!("{}", Table::new(&rows).with(Style::rounded()));
    }
    if !invitations.is_empty() {
        println!("\nPending invitations:");
        for invitation in &invitations {
            let expires = short_timestamp(&invitation.expires_at);
            println!(
                "  {} ({}), expires {expires}",
                invitation.email,
                invitation.role.as_str()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_users() -> BrigadeService {
        let service = BrigadeService::new_in_memory().unwrap();
        service.create_user("chef@bistro.fr", "Chef", "Bistro").unwrap();
        service.create_user("commis@bistro.fr", "Commis", "").unwrap();
        service
    }

    fn pending_token(service: &BrigadeService, owner: &str) -> String {
        let ctx = acting_as(service, owner).unwrap();
        let invitations = service.list_invitations(&ctx).unwrap();
        assert_eq!(invitations.len(), 1);
        invitations[0].token.clone()
    }

    #[test]
    fn test_team_invite_then_accept() {
        let service = service_with_users();
        cmd_team_invite(&service, "chef@bistro.fr", "commis@bistro.fr", "Viewer", false).unwrap();
        let token = pending_token(&service, "chef@bistro.fr");

        cmd_team_accept(&service, "commis@bistro.fr", &token, true).unwrap();
        cmd_team_list(&service, "chef@bistro.fr", false).unwrap();

        let owner = acting_as(&service, "chef@bistro.fr").unwrap();
        let members = service.list_team(&owner).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].email, "commis@bistro.fr");
        assert_eq!(members[0].role, TeamRole::Viewer);
        assert!(service.list_invitations(&owner).unwrap().is_empty());
    }

    #[test]
    fn test_team_invite_rejects_unknown_role() {
        let service = service_with_users();
        let err = cmd_team_invite(&service, "chef@bistro.fr", "commis@bistro.fr", "admin", true)
            .unwrap_err();
        assert!(err.to_string().contains("Invalid role"));
    }

    #[test]
    fn test_team_accept_requires_invited_email() {
        let service = service_with_users();
        service.create_user("intrus@bistro.fr", "", "").unwrap();
        cmd_team_invite(&service, "chef@bistro.fr", "commis@bistro.fr", "editor", true).unwrap();
        let token = pending_token(&service, "chef@bistro.fr");

        assert!(cmd_team_accept(&service, "intrus@bistro.fr", &token, true).is_err());
        assert!(cmd_team_accept(&service, "commis@bistro.fr", "bogus", true).is_err());
        cmd_team_accept(&service, "commis@bistro.fr", &token, false).unwrap();
    }

    #[test]
    fn test_team_commands_require_known_user() {
        let service = service_with_users();
        assert!(cmd_team_list(&service, "ghost@bistro.fr", true).is_err());
        assert!(cmd_team_invite(&service, "ghost@bistro.fr", "commis@bistro.fr", "editor", true).is_err());
    }
}
