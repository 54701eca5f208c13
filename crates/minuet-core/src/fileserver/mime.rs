//! Extension → content-type table with display priorities.

pub struct MimeMapping {
    pub extension: &'static str,
    pub mime_type: &'static str,
    pub priority: i32,
}

pub const MIME_MAPPINGS: &[MimeMapping] = &[
    MimeMapping { extension: ".html", mime_type: "text/html", priority: 100 },
    MimeMapping { extension: ".htm", mime_type: "text/html", priority: 100 },
    MimeMapping { extension: ".css", mime_type: "text/css", priority: 90 },
    MimeMapping { extension: ".js", mime_type: "application/javascript", priority: 80 },
    MimeMapping { extension: ".json", mime_type: "application/json", priority: 70 },
    MimeMapping { extension: ".png", mime_type: "image/png", priority: 60 },
    MimeMapping { extension: ".jpg", mime_type: "image/jpeg", priority: 60 },
    MimeMapping { extension: ".jpeg", mime_type: "image/jpeg", priority: 60 },
    MimeMapping { extension: ".gif", mime_type: "image/gif", priority: 50 },
    MimeMapping { extension: ".svg", mime_type: "image/svg+xml", priority: 70 },
    MimeMapping { extension: ".ico", mime_type: "image/x-icon", priority: 40 },
    MimeMapping { extension: ".pdf", mime_type: "application/pdf", priority: 30 },
    MimeMapping { extension: ".txt", mime_type: "text/plain", priority: 20 },
    MimeMapping { extension: ".xml", mime_type: "application/xml", priority: 30 },
    MimeMapping { extension: ".woff", mime_type: "font/woff", priority: 85 },
    MimeMapping { extension: ".woff2", mime_type: "font/woff2", priority: 85 },
    MimeMapping { extension: ".ttf", mime_type: "font/ttf", priority: 85 },
    MimeMapping { extension: ".eot", mime_type: "application/vnd.ms-fontobject", priority: 85 },
    MimeMapping { extension: ".mp4", mime_type: "video/mp4", priority: 10 },
    MimeMapping { extension: ".webm", mime_type: "video/webm", priority: 10 },
    MimeMapping { extension: ".mp3", mime_type: "audio/mpeg", priority: 10 },
    MimeMapping { extension: ".wav", mime_type: "audio/wav", priority: 10 },
    MimeMapping { extension: ".zip", mime_type: "application/zip", priority: 5 },
];

fn extension_of(filename: &str) -> Option<&str> {
    filename.rfind('.').map(|idx| &filename[idx..])
}

pub fn mime_type(filename: &str) -> &'static str {
    let Some(ext) = extension_of(filename) else {
        return "application/octet-stream";
    };
    MIME_MAPPINGS
        .iter()
        .find(|m| m.extension.eq_ignore_ascii_case(ext))
        .map(|m| m.mime_type)
        .unwrap_or("application/octet-stream")
}

pub fn resource_priority(filename: &str) -> i32 {
    let Some(ext) = extension_of(filename) else {
        return 0;
    };
    MIME_MAPPINGS
        .iter()
        .find(|m| m.extension.eq_ignore_ascii_case(ext))
        .map(|m| m.priority)
        .unwrap_or(0)
}

pub fn has_known_extension(path: &str) -> bool {
    extension_of(path)
        .map(|ext| {
            MIME_MAPPINGS
                .iter()
                .any(|m| m.extension.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions_resolve() {
        assert_eq!(mime_type("/hello.css"), "text/css");
        assert_eq!(mime_type("/page.HTML"), "text/html");
        assert_eq!(mime_type("/app.js"), "application/javascript");
        assert_eq!(mime_type("/font.woff2"), "font/woff2");
    }

    #[test]
    fn unknown_extension_falls_back_to_octet_stream() {
        assert_eq!(mime_type("/data.bin"), "application/octet-stream");
        assert_eq!(mime_type("/noext"), "application/octet-stream");
    }

    #[test]
    fn priorities_follow_the_table() {
        assert_eq!(resource_priority("/a.html"), 100);
        assert_eq!(resource_priority("/a.css"), 90);
        assert_eq!(resource_priority("/a.zip"), 5);
        assert_eq!(resource_priority("/a.unknown"), 0);
    }

    #[test]
    fn known_extension_check() {
        assert!(has_known_extension("/x/logo.png"));
        assert!(!has_known_extension("/x/logo"));
        assert!(!has_known_extension("/x/logo.wasm"));
    }
}
