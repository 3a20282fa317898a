use anyhow::Result;
use serde::Serialize;
use std::process;

use brigade_core::models::SessionContext;
use brigade_core::service::BrigadeService;

/// The local CLI acts as the user named by `--user`.
pub(crate) fn acting_as(service: &BrigadeService, email: &str) -> Result<SessionContext> {
    Ok(service.context_for_email(email)?)
}

pub(crate) fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print an empty listing and exit with status 2.
pub(crate) fn exit_empty(what: &str, json: bool) -> ! {
    if json {
        println!("[]");
    } else {
        eprintln!("No {what} found");
    }
    process::exit(2);
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

/// `250`, `1.5`, or empty when there is no quantity.
pub(crate) fn format_quantity(quantity: Option<f64>) -> String {
    match quantity {
        None => String::new(),
        Some(q) if q.fract() == 0.0 => format!("{q:.0}"),
        Some(q) => {
            let s = format!("{q:.3}");
            s.trim_end_matches('0').trim_end_matches('.').to_string()
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

/// `2026-03-01T10:00:00Z` → `2026-03-01 10:00`.
pub(crate) fn short_timestamp(ts: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map_or_else(|_| ts.to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_quantity() {
        assert_eq!(format_quantity(None), "");
        assert_eq!(format_quantity(Some(250.0)), "250");
        assert_eq!(format_quantity(Some(1.5)), "1.5");
        assert_eq!(format_quantity(Some(0.125)), "0.125");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("Tarte Tatin aux pommes", 10), "Tarte T...");
        assert_eq!(truncate("Crème brûlée maison", 8), "Crème...");
    }

    #[test]
    fn test_short_timestamp() {
        assert_eq!(short_timestamp("2026-03-01T10:00:00Z"), "2026-03-01 10:00");
        assert_eq!(short_timestamp("garbage"), "garbage");
    }

    #[test]
    fn test_json_error_escapes() {
        assert_eq!(json_error("bad \"id\""), r#"{"error":"bad \"id\""}"#);
    }

    #[test]
    fn test_acting_as_unknown_user() {
        let service = BrigadeService::new_in_memory().unwrap();
        let err = acting_as(&service, "ghost@example.com").unwrap_err();
        assert!(err.to_string().contains("ghost@example.com"));
    }
}
