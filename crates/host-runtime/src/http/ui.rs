//! Static UI files under `R/ui`.

use crate::registry::RegisteredBit;
use axum::body::Body;
use axum::extract::Request;
use axum::response::{Html, IntoResponse, Response};
use bit_contracts::BitError;
use tower::ServiceExt;
use tower_http::services::ServeDir;

/// Serve `sub_path` (empty or starting with `/`) from the bit's `ui/`
/// directory. `R/ui` itself falls back to a generated page when the module
/// ships no `index.html`.
pub async fn serve(entry: &RegisteredBit, sub_path: &str, request: Request) -> Response {
    let ui_dir = entry.ui_dir();
    let is_root = sub_path.is_empty() || sub_path == "/";

    if is_root && !ui_dir.join("index.html").is_file() {
        return Html(fallback_page(entry)).into_response();
    }
    if !ui_dir.is_dir() {
        return BitError::NotFound(format!("bit {} has no ui directory", entry.bit.name()))
            .into_response();
    }

    let target = if is_root { "/" } else { sub_path };
    let inner = match Request::builder()
        .method(request.method().clone())
        .uri(target)
        .body(Body::empty())
    {
        Ok(inner) => inner,
        Err(e) => return BitError::bad_request(e).into_response(),
    };

    match ServeDir::new(&ui_dir).oneshot(inner).await {
        Ok(response) => response.into_response(),
        Err(never) => match never {},
    }
}

/// Page shown for bits without their own UI.
pub fn fallback_page(entry: &RegisteredBit) -> String {
    let info = entry.info();
    let route = escape(&entry.route);
    let mut links = String::new();
    if info.state_key.is_some() || entry.bit.state().is_some() {
        links.push_str(&format!(
            "<li><a href=\"{route}/state\">state</a> (<a href=\"{route}/state/stream\">live</a>)</li>"
        ));
    }
    if info.configurable {
        links.push_str(&format!(
            "<li><a href=\"{route}/config\">config</a> (<a href=\"{route}/config/schema\">schema</a>)</li>"
        ));
    }

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{name}</title></head>\
         <body><h1>{name}</h1><p>{description}</p>\
         <p>Module <code>{module}</code>, route <code>{route}</code></p>\
         <ul><li><a href=\"{route}\">{route}</a></li>{links}</ul></body></html>\n",
        name = escape(&info.name),
        description = escape(&info.description),
        module = escape(&entry.module_id),
    )
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape() {
        assert_eq!(escape("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#39;");
        assert_eq!(escape("plain"), "plain");
    }
}
