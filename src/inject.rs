//! Panel rendering and response-body injection
//!
//! Everything that touches the response body as a string lives here: the
//! panel markup builder, the head/body insertion fallback chains, and the
//! `_debugger` side-channel merge for JSON responses. Injection is string
//! surgery, not HTML parsing; the fallback chains keep it safe on partial
//! documents.

use crate::aggregator::{scalar_text, Entry, TabItem, TraceTabs};
use crate::config::TraceConfig;
use serde_json::Value;

pub const ASSET_CSS_PATH: &str = "/__trace/assets/trace.css";
pub const ASSET_JS_PATH: &str = "/__trace/assets/trace.js";

const LOGO_PNG_BASE64: &str = "iVBORw0KGgoAAAANSUhEUgAAABQAAAAUCAYAAACNiR0NAAAAAXNSR0IArs4c6QAAAcBJREFUOE/F1MtKAlEYB/DvaI1OlJIuhBYKFbSzi9lKcIJadnkIoQeoTYvw0mu0laBlPYAOQUG2cFGEQdioQXbTUcsy9cQZm+HkXBRcdEAGjt/8zn/OzHcQ9DEwH4qQMhQ8kK5GAxn9iRMhDsw4DBi4Th2K9kI1QTXUvaw+rAI7j4fDvR5NL7ECSqlMOKEJ2WcAxIz2GgiSgBEvb4UE5g8DHGsdizgdE8Huu7B3B4CAZOROAAnHf0rE50pauCnA7N75vLTLMohwJ52VtfEExp51APeadqpfOHuV40vFshTCF0tJlgokkzb/dnF0atOlt49NsdDIHu3mag+303KNIch6t8BsnwTLECNaXIt2+aZW6b7+ep2sm0fGHU9ncfh8EZQ1+wLlaqb9VawIwjCB5LmBwGb1sY4/zCy9Bf8LMp5VYNwrSqCBExKJvBQCkysNiplTIL/uYfhS6GICmpxLb9W7rEMLkr49DMmF/dSy8h3KQD4eiCCk7uNGrZ0uFZpzOr0X9cUulGNNdTiQNoQ2cDSsBdKp6IV0z0M6LQ0SqGXCUX/0MqmV2PCAlfo8Hoh8v7c2yvlm2QiS8Z6gXj/rzf8AmFQQJJO/2LAAAAAASUVORK5CYII=";

/// Build the panel markup for a finished trace. Returns the collapsed
/// floating widget plus all tab content; the companion stylesheet and
/// script are injected separately.
pub fn render_panel(tabs: &TraceTabs, config: &TraceConfig) -> String {
    let mut html = String::with_capacity(8 * 1024);

    html.push_str("<div id=\"trace-tools-box\">");
    html.push_str("<div class=\"trace-logo\">");
    html.push_str(&format!(
        "<img src=\"data:image/png;base64,{}\" alt=\"Logo\" style=\"height: 18px;\" class=\"logo\">",
        LOGO_PNG_BASE64
    ));
    html.push_str("<span class=\"title\">Trace</span></div>");

    html.push_str("<div class=\"tabs-container\"><div class=\"tabs-header\">");
    html.push_str(&format!(
        "<img src=\"data:image/png;base64,{}\" alt=\"Logo\" class=\"tabs-logo-small\">",
        LOGO_PNG_BASE64
    ));
    html.push_str("<div class=\"tabs-menu\">");
    for (index, tab) in tabs.tabs.iter().enumerate() {
        let active = if index == 0 { " active" } else { "" };
        html.push_str(&format!(
            "<div class=\"tabs-item{}\" data-tab=\"tab{}\">{}</div>",
            active,
            index + 1,
            html_escape::encode_text(&tab.title)
        ));
    }
    html.push_str("</div><div class=\"tabs-close\">关闭</div></div>");

    for (index, tab) in tabs.tabs.iter().enumerate() {
        let active = if index == 0 { " active" } else { "" };
        html.push_str(&format!(
            "<div id=\"tab{}\" class=\"tabs-content{}\"><ul>",
            index + 1,
            active
        ));
        for entry in &tab.entries {
            html.push_str("<li>");
            render_entry(&mut html, entry, config);
            html.push_str("</li>");
        }
        html.push_str("</ul></div>");
    }

    html.push_str("</div></div>");
    html
}

fn render_entry(html: &mut String, entry: &Entry, config: &TraceConfig) {
    if let Some(label) = &entry.label {
        html.push_str(&format!(
            "<span class=\"json-label\">{}</span>",
            html_escape::encode_text(label)
        ));
    }

    // Rows without a label render their value with the wider label class,
    // matching how list-style tabs (SQL, views) are displayed.
    let value_class = if entry.label.is_some() {
        "json-string-content"
    } else {
        "json-label"
    };

    match &entry.item {
        TabItem::Text(text) => {
            html.push_str(&format!(
                "<div class=\"{}\">{}</div>",
                value_class,
                html_escape::encode_text(text)
            ));
        }
        TabItem::Json(value) => render_json(html, value),
        TabItem::Sql { sql, duration_ms } => {
            html.push_str(&format!(
                "<div class=\"{}\">{}</div>",
                value_class,
                html_escape::encode_text(sql)
            ));
            match duration_ms {
                Some(duration) => html.push_str(&format!(
                    "<span class=\"json-right\">{:.2}ms</span>",
                    duration
                )),
                None => html.push_str("<span class=\"json-right\">-</span>"),
            }
        }
        TabItem::Message(message) => {
            html.push_str(&format!(
                "<span class=\"json-label\"><a href=\"{}\" class=\"trace-link\">{}</a></span>",
                html_escape::encode_double_quoted_attribute(&editor_link(
                    &config.editor,
                    &message.file,
                    message.line
                )),
                html_escape::encode_text(&message.label)
            ));
            match &message.value {
                Value::Object(_) | Value::Array(_) => render_json(html, &message.value),
                scalar => {
                    html.push_str(&format!(
                        "<div class=\"json-string-content\">{}</div>",
                        html_escape::encode_text(&scalar_text(scalar))
                    ));
                }
            }
            html.push_str(&format!(
                "<span class=\"json-right\">{}</span>",
                html_escape::encode_text(&message.kind)
            ));
        }
        TabItem::Code(code) => {
            html.push_str(&format!(
                "<div class=\"json-string-content\"><pre><code>{}</code></pre></div>",
                html_escape::encode_text(code)
            ));
        }
        TabItem::SourceLink { label, file, line } => {
            html.push_str(&format!(
                "<div class=\"json-string-content\"><a href=\"{}\" class=\"trace-link\">{}</a></div>",
                html_escape::encode_double_quoted_attribute(&editor_link(
                    &config.editor,
                    file,
                    *line
                )),
                html_escape::encode_text(label)
            ));
        }
    }
}

/// Structured values render as a foldable arrow plus a `<pre class="json">`
/// holding the serialized value; the client script re-parses that text and
/// sets the `▶ {object|array}:{count}` arrow label.
fn render_json(html: &mut String, value: &Value) {
    let empty = match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if empty {
        html.push_str("<span class=\"json-string-content\">array[]</span>");
        return;
    }

    let serialized = value.to_string();
    html.push_str(&format!(
        "<div class=\"json-arrow-pre-wrapper\">\
         <span class=\"json-arrow\" onclick=\"toggleJson(this)\">▶</span>\
         <pre class=\"json\" data-original=\"{}\">{}</pre></div>",
        html_escape::encode_double_quoted_attribute(&serialized),
        html_escape::encode_text(&serialized)
    ));
}

fn editor_link(editor: &str, file: &str, line: u32) -> String {
    format!(
        "{}://open?file={}&line={}",
        editor,
        urlencoding::encode(file),
        line
    )
}

/// Inject the stylesheet link and the panel + script into an HTML body.
///
/// Head insertion: before the last `</head>` (case-insensitive), else just
/// after `<head ...>`, else prepended to the document. Body insertion:
/// before the last `</body>`, else just after `<body ...>`, else appended.
pub fn inject_into_html(content: &str, panel: &str) -> String {
    let style = format!(
        "<link rel=\"stylesheet\" type=\"text/css\" href=\"{}\" data-turbolinks-eval=\"false\" data-turbo-eval=\"false\">",
        ASSET_CSS_PATH
    );
    let script = format!(
        "<script src=\"{}\" type=\"text/javascript\" data-turbolinks-eval=\"false\" data-turbo-eval=\"false\"></script>",
        ASSET_JS_PATH
    );

    let mut content = match rfind_ci(content, "</head>") {
        Some(pos) => splice(content, pos, &format!("\n{}\n", style)),
        None => match find_tag_end(content, "<head") {
            Some(pos) => splice(content, pos, &format!("\n{}\n", style)),
            None => format!("{}\n{}", style, content),
        },
    };

    let insertion = format!("\n{}\n{}", panel, script);
    content = match rfind_ci(&content, "</body>") {
        Some(pos) => splice(&content, pos, &insertion),
        None => match find_tag_end(&content, "<body") {
            Some(pos) => splice(&content, pos, &format!("{}\n", insertion)),
            None => format!("{}{}", content, insertion),
        },
    };

    content
}

/// Merge the rendered panel markup into a JSON response body under
/// `_debugger`. Returns `None` when the body is not a JSON object,
/// leaving the response alone.
pub fn merge_debugger_field(body: &str, panel: &str) -> Option<String> {
    let mut value: Value = serde_json::from_str(body).ok()?;
    let map = value.as_object_mut()?;
    map.insert("_debugger".to_string(), Value::String(panel.to_string()));
    serde_json::to_string(&value).ok()
}

/// Byte offset of the last case-insensitive occurrence of an ASCII needle.
fn rfind_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().rfind(&needle.to_ascii_lowercase())
}

/// Byte offset just past the `>` closing an opening tag like `<head ...>`.
fn find_tag_end(haystack: &str, open: &str) -> Option<usize> {
    let lower = haystack.to_ascii_lowercase();
    let start = lower.find(open)?;
    let close = lower[start..].find('>')?;
    Some(start + close + 1)
}

fn splice(content: &str, pos: usize, insertion: &str) -> String {
    let mut out = String::with_capacity(content.len() + insertion.len());
    out.push_str(&content[..pos]);
    out.push_str(insertion);
    out.push_str(&content[pos..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Tab;
    use serde_json::json;

    fn tabs_with(entries: Vec<Entry>) -> TraceTabs {
        TraceTabs {
            tabs: vec![Tab {
                key: "messages".to_string(),
                title: "Messages (1)".to_string(),
                entries,
            }],
        }
    }

    #[test]
    fn test_panel_contains_tab_nav_and_content() {
        let tabs = tabs_with(vec![Entry {
            label: Some("请求信息".to_string()),
            item: TabItem::Text("GET /".to_string()),
        }]);
        let html = render_panel(&tabs, &TraceConfig::default());

        assert!(html.contains("id=\"trace-tools-box\""));
        assert!(html.contains("data-tab=\"tab1\""));
        assert!(html.contains("Messages (1)"));
        assert!(html.contains("请求信息"));
        assert!(html.contains("class=\"tabs-close\""));
    }

    #[test]
    fn test_structured_values_get_foldable_json() {
        let tabs = tabs_with(vec![Entry {
            label: Some("query".to_string()),
            item: TabItem::Json(json!({"page": "2"})),
        }]);
        let html = render_panel(&tabs, &TraceConfig::default());

        assert!(html.contains("class=\"json-arrow\""));
        assert!(html.contains("<pre class=\"json\" data-original="));
        assert!(html.contains("&quot;page&quot;"));
    }

    #[test]
    fn test_empty_structured_value_renders_placeholder() {
        let tabs = tabs_with(vec![Entry {
            label: Some("query".to_string()),
            item: TabItem::Json(json!({})),
        }]);
        let html = render_panel(&tabs, &TraceConfig::default());
        assert!(html.contains("array[]"));
        assert!(!html.contains("json-arrow"));
    }

    #[test]
    fn test_text_values_are_escaped() {
        let tabs = tabs_with(vec![Entry {
            label: None,
            item: TabItem::Text("select * from t where a < 1 <script>".to_string()),
        }]);
        let html = render_panel(&tabs, &TraceConfig::default());
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("1 <script>"));
    }

    #[test]
    fn test_editor_link_encodes_path() {
        let link = editor_link("vscode", "/srv/app/src/main.rs", 12);
        assert_eq!(link, "vscode://open?file=%2Fsrv%2Fapp%2Fsrc%2Fmain.rs&line=12");
    }

    #[test]
    fn test_inject_into_complete_document() {
        let doc = "<html><head><title>t</title></head><body><p>hi</p></body></html>";
        let out = inject_into_html(doc, "<div id=\"trace-tools-box\"></div>");

        let link = out.find(ASSET_CSS_PATH).unwrap();
        let head_close = out.find("</head>").unwrap();
        assert!(link < head_close);

        let panel = out.find("trace-tools-box").unwrap();
        let script = out.find(ASSET_JS_PATH).unwrap();
        let body_close = out.rfind("</body>").unwrap();
        assert!(panel < script && script < body_close);
    }

    #[test]
    fn test_inject_without_head_prepends_style() {
        let doc = "<html><body>Hi</body></html>";
        let out = inject_into_html(doc, "<div id=\"trace-tools-box\"></div>");

        assert!(out.starts_with("<link"));
        let panel = out.find("trace-tools-box").unwrap();
        let body_close = out.rfind("</body>").unwrap();
        assert!(panel < body_close);
        assert!(out.ends_with("</body></html>"));
    }

    #[test]
    fn test_inject_is_case_insensitive() {
        let doc = "<HTML><HEAD></HEAD><BODY>x</BODY></HTML>";
        let out = inject_into_html(doc, "<div></div>");
        let link = out.find(ASSET_CSS_PATH).unwrap();
        assert!(link < out.find("</HEAD>").unwrap());
        assert!(out.find(ASSET_JS_PATH).unwrap() < out.rfind("</BODY>").unwrap());
    }

    #[test]
    fn test_inject_uses_last_body_close() {
        let doc = "<body><code>&lt;/body&gt; </body>example</code>trailing</body>";
        let out = inject_into_html(doc, "<div id=\"panel\"></div>");
        let panel = out.find("id=\"panel\"").unwrap();
        assert!(panel > out.find("trailing").unwrap());
    }

    #[test]
    fn test_inject_without_any_tags_appends() {
        let out = inject_into_html("plain fragment", "<div id=\"panel\"></div>");
        assert!(out.starts_with("<link"));
        assert!(out.contains("plain fragment"));
        assert!(out.trim_end().ends_with("</script>"));
    }

    #[test]
    fn test_merge_debugger_into_object() {
        let tabs = tabs_with(vec![Entry {
            label: Some("请求信息".to_string()),
            item: TabItem::Text("POST /api".to_string()),
        }]);
        let panel = render_panel(&tabs, &TraceConfig::default());
        let out = merge_debugger_field("{\"a\":1}", &panel).unwrap();
        let value: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["a"], json!(1));

        // The side channel carries the rendered markup string, not a
        // structured dump.
        let debugger = value["_debugger"].as_str().unwrap();
        assert!(debugger.contains("trace-tools-box"));
    }

    #[test]
    fn test_merge_debugger_skips_non_objects() {
        let panel = "<div id=\"trace-tools-box\"></div>";
        assert!(merge_debugger_field("[1,2,3]", panel).is_none());
        assert!(merge_debugger_field("not json", panel).is_none());
        assert!(merge_debugger_field("\"str\"", panel).is_none());
    }
}
