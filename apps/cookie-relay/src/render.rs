//! HTML pages and the text pushed over the live channel.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

pub const PAGE_TITLE: &str = "Cookie Relay";

/// Sites offered on the form, as `host|locale` and a label.
pub const SITES: &[(&str, &str)] = &[
    ("alexa.amazon.com|en-US", "United States"),
    ("alexa.amazon.ca|en-US", "Canada"),
    ("amazon.co.uk|en-GB", "United Kingdom"),
    ("alexa.amazon.it|it-IT", "Italy"),
];

static URL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:https?://|www\.)[^\s<>"']+"#).expect("url pattern is valid")
});

pub fn escape_html(text: &str) -> String {
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

/// Escape `text` and wrap every URL in an anchor.
pub fn linkify(text: &str) -> String {
    let escaped = escape_html(text);
    URL_PATTERN
        .replace_all(&escaped, |caps: &regex::Captures<'_>| {
            let shown = &caps[0];
            // Trailing punctuation belongs to the sentence, not the link.
            let trimmed = shown.trim_end_matches(['.', ',', ';', ':', '!', '?', ')']);
            let rest = &shown[trimmed.len()..];
            let href = if trimmed.to_ascii_lowercase().starts_with("www.") {
                format!("http://{trimmed}")
            } else {
                trimmed.to_string()
            };
            format!("<a href=\"{href}\" target=\"_blank\">{trimmed}</a>{rest}")
        })
        .into_owned()
}

pub fn index_page() -> String {
    let mut sites = String::new();
    for (i, (value, label)) in SITES.iter().enumerate() {
        let checked = if i == 0 { " checked" } else { "" };
        sites.push_str(&format!(
            "<input type=\"radio\" name=\"amazonSite\" value=\"{value}\"{checked}> {label}<br>\n"
        ));
    }
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{PAGE_TITLE}</title>
</head>
<body>
    <form action="/" method="post">
        <fieldset>
            <legend>Account information:</legend>
            Username:<br>
            <input type="email" name="username" required><br>
            <br>
            Password:<br>
            <input type="password" name="password" required><br>
            <br>
            Country:<br>
            {sites}
            <br>
            <input type="submit" value="Submit">
        </fieldset>
    </form>
</body>
</html>
"#
    )
}

pub fn missing_credentials_page() -> String {
    r#"Username and password are required!<br>
<br>
<button onclick="goBack()">Go Back</button>
<script> function goBack() { window.history.back(); }</script>
"#
    .to_string()
}

/// Page shown while the job runs; its script subscribes to `/ws/<session>`.
pub fn waiting_page(session_id: &str) -> String {
    let session_id = escape_html(session_id);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>{PAGE_TITLE}</title>
</head>
<body>
    <div id="text">Please wait...</div>
    <script>
        var scheme = window.location.protocol === "https:" ? "wss://" : "ws://";
        var socket = new WebSocket(scheme + window.location.host + "/ws/{session_id}");
        socket.onmessage = function (event) {{
            var msg = JSON.parse(event.data);
            if (msg.type === "text") {{
                document.getElementById("text").innerHTML = msg.html;
                addListeners();
            }}
        }};
        function addListeners() {{
            var list = document.getElementsByTagName("a");
            for (var i = 0; i < list.length; ++i) {{
                list[i].onclick = function () {{
                    document.getElementById("text").innerHTML = "Please wait...";
                }};
            }}
        }}
    </script>
</body>
</html>
"#
    )
}

/// Intermediate handshake error; the job may still succeed afterwards.
pub fn negotiation_error(message: &str) -> String {
    format!(
        "ERROR: {}<br><br><br>If you already have inserted your credential in the sign-in page, please wait...",
        linkify(message)
    )
}

/// Final message carrying the polling URL and the payload to copy.
pub fn negotiation_success(refresh_url: &str, payload: &Value) -> String {
    let registration = serde_json::to_string(payload).unwrap_or_else(|_| "{}".into());
    format!(
        r#"
OAuth generated successfully!<br>
Copy this data into the automation app<br>
<br>
<b>RefreshURL:</b><br>
<textarea readonly rows="1" style="width:100%">{}</textarea><br>
<br>
<b>RefreshOptions:</b><br>
<textarea readonly rows="25" style="width:100%">{}</textarea>
"#,
        escape_html(refresh_url),
        escape_html(&registration)
    )
}
