//! HTML bodies for blocked responses.

const STYLE: &str = "body{font-family:sans-serif;max-width:40em;margin:4em auto;color:#222}\
h1{color:#b00020}code{background:#eee;padding:0 .3em}";

fn page(title: &str, message: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{title}</title>\
<style>{STYLE}</style></head><body><h1>{title}</h1><p>{message}</p></body></html>\n"
    )
}

/// Served with 403 when the client IP is blacklisted
pub fn banned() -> String {
    page(
        "Access denied",
        "Your IP address has been banned from this site.",
    )
}

/// Served with 403 when a request matches an attack signature
pub fn waf_blocked(rule_id: &str) -> String {
    let rule_id: String = rule_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    page(
        "Request blocked",
        &format!(
            "This request was blocked by the web application firewall (rule <code>{}</code>).",
            rule_id
        ),
    )
}
