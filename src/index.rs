//! Fallback index page listing everything the gateway currently serves

use crate::config::Config;
use crate::discovery::{Container, ForwardKind};
use crate::error::{html_response, GatewayBody};
use hyper::{Response, StatusCode};
use std::sync::Arc;
use tracing::warn;

/// One row on the index page.
struct IndexRow {
    host: String,
    linked: bool,
    service_name: String,
    service_version: String,
    forward_name: String,
    forward_key: String,
    status: String,
    started_at: String,
}

/// Renders the index page for requests no virtual host claims.
pub struct IndexPage {
    host_proto: String,
    host_suffix: String,
    host_self: String,
    /// Optional operator shell with `{{message}}` / `{{hosts}}` placeholders
    preview: Option<String>,
}

impl IndexPage {
    pub fn new(config: &Config) -> Self {
        let preview = if config.preview.is_empty() {
            None
        } else {
            match std::fs::read_to_string(&config.preview) {
                Ok(shell) => Some(shell),
                Err(e) => {
                    warn!(path = %config.preview, error = %e, "Preview shell unreadable, using built-in page");
                    None
                }
            }
        };
        Self {
            host_proto: config.host_proto.clone(),
            host_suffix: config.host_suffix.clone(),
            host_self: config.host_self.clone(),
            preview,
        }
    }

    /// Render the page. Requests for hosts other than `host_self` get a 404
    /// with a diagnostic message but still see the full listing.
    pub fn render(
        &self,
        request_host: &str,
        entries: Vec<(String, Arc<Container>)>,
    ) -> Response<GatewayBody> {
        let rows = self.build_rows(entries);
        let not_self = request_host != self.host_self;
        let message = if not_self {
            format!("{} not found", request_host)
        } else {
            String::new()
        };

        let table = render_table(&rows);
        let body = match &self.preview {
            Some(shell) => shell
                .replace("{{message}}", &message)
                .replace("{{hosts}}", &table),
            None => {
                let mut page = String::from(
                    "<style>\n  td { padding: 2px 8px 2px 8px; }\n</style>\n",
                );
                if not_self {
                    page.push_str(&format!("<pre>\n{}\n</pre>\n", message));
                }
                page.push_str("Having:\n");
                page.push_str(&table);
                page
            }
        };

        let status = if not_self {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::OK
        };
        html_response(status, body)
    }

    fn build_rows(&self, entries: Vec<(String, Arc<Container>)>) -> Vec<IndexRow> {
        let mut rows: Vec<IndexRow> = entries
            .into_iter()
            .filter_map(|(prefix, service)| {
                let forward = service.forwards.get(&prefix)?;
                let (host, linked) = match forward.kind {
                    ForwardKind::Http => (
                        format!("{}://{}{}", self.host_proto, forward.prefix, self.host_suffix),
                        true,
                    ),
                    _ => (forward.prefix.clone(), false),
                };
                Some(IndexRow {
                    host,
                    linked,
                    service_name: service.name.clone(),
                    service_version: service.version.clone(),
                    forward_name: forward.name.clone(),
                    forward_key: forward.key.clone(),
                    status: service.status.clone(),
                    started_at: service.started_at.clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| {
            (
                &a.service_name,
                &a.service_version,
                &a.forward_name,
                &a.host,
            )
                .cmp(&(&b.service_name, &b.service_version, &b.forward_name, &b.host))
        });
        rows
    }
}

fn render_table(rows: &[IndexRow]) -> String {
    let mut table = String::from("<table>\n");
    for row in rows {
        let host_cell = if row.linked {
            format!(r#"<a target="_blank" href="{}">{}</a>"#, row.host, row.host)
        } else {
            row.host.clone()
        };
        table.push_str(&format!(
            "<tr><td>{}-{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            row.service_name,
            row.service_version,
            row.forward_name,
            row.forward_key,
            host_cell,
            row.status,
            row.started_at,
        ));
    }
    table.push_str("</table>\n");
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Forward;
    use http_body_util::BodyExt;
    use std::collections::HashMap;

    fn page() -> IndexPage {
        IndexPage {
            host_proto: "https".to_string(),
            host_suffix: ".example".to_string(),
            host_self: "gateway.example".to_string(),
            preview: None,
        }
    }

    fn entry(service: &str, version: &str, forward_name: &str, kind: ForwardKind) -> (String, Arc<Container>) {
        let prefix = match kind {
            ForwardKind::Http => format!("{}.{}.{}", forward_name, version.replace('.', ""), service),
            _ => format!("{}://127.0.0.1:5432", kind),
        };
        let forward = Forward {
            name: forward_name.to_string(),
            kind,
            key: forward_name.to_string(),
            prefix: prefix.clone(),
            uri: "10.0.0.5:32001".to_string(),
            wildcard: false,
        };
        let mut forwards = HashMap::new();
        forwards.insert(prefix.clone(), forward);
        (
            prefix,
            Arc::new(Container {
                id: "c1".to_string(),
                name: service.to_string(),
                version: version.to_string(),
                forwards,
                status: "running".to_string(),
                started_at: "2024-03-01T10:00:00Z".to_string(),
                ..Default::default()
            }),
        )
    }

    async fn body_of(resp: Response<GatewayBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_rows_sorted_by_service_version_forward() {
        let page = page();
        let entries = vec![
            entry("zeta", "v1.0", "api", ForwardKind::Http),
            entry("alpha", "v2.0", "api", ForwardKind::Http),
            entry("alpha", "v1.0", "www", ForwardKind::Http),
            entry("alpha", "v1.0", "api", ForwardKind::Http),
        ];
        let resp = page.render("gateway.example", entries);
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_of(resp).await;

        let alpha_api = body.find("api.v10.alpha").unwrap();
        let alpha_www = body.find("www.v10.alpha").unwrap();
        let alpha_v2 = body.find("api.v20.alpha").unwrap();
        let zeta = body.find("api.v10.zeta").unwrap();
        assert!(alpha_api < alpha_www);
        assert!(alpha_www < alpha_v2);
        assert!(alpha_v2 < zeta);
    }

    #[tokio::test]
    async fn test_foreign_host_gets_404_with_listing() {
        let page = page();
        let resp = page.render("nope.example", vec![entry("web", "v1.0", "api", ForwardKind::Http)]);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_of(resp).await;
        assert!(body.contains("nope.example not found"));
        assert!(body.contains("api.v10.web"));
    }

    #[tokio::test]
    async fn test_stream_forward_rendered_without_link() {
        let page = page();
        let resp = page.render("gateway.example", vec![entry("web", "v1.0", "db", ForwardKind::Tcp)]);
        let body = body_of(resp).await;
        assert!(body.contains("tcp://127.0.0.1:5432"));
        assert!(!body.contains(r#"href="tcp://"#));
    }
}
