//! Flat view of a `uiautomator dump` hierarchy.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    /// Parses `[l,t][r,b]`.
    pub fn parse(value: &str) -> Option<Self> {
        let inner = value.trim().strip_prefix('[')?.strip_suffix(']')?;
        let (first, second) = inner.split_once("][")?;
        let pair = |raw: &str| -> Option<(i32, i32)> {
            let (x, y) = raw.split_once(',')?;
            Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
        };
        let (left, top) = pair(first)?;
        let (right, bottom) = pair(second)?;
        Some(Self {
            left,
            top,
            right,
            bottom,
        })
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UiNode {
    pub resource_id: String,
    pub text: String,
    pub content_desc: String,
    pub class: String,
    pub bounds: Bounds,
}

impl UiNode {
    /// Matches a full resource id or only its `:id/` suffix.
    pub fn has_id(&self, id: &str) -> bool {
        !id.is_empty()
            && (self.resource_id == id
                || self
                    .resource_id
                    .rsplit_once(":id/")
                    .is_some_and(|(_, short)| short == id))
    }
}

/// Collects every `<node>` element in document order.
///
/// Anything surrounding the XML document (such as the trailing
/// "UI hierchary dumped to" notice) is ignored, as are malformed tags.
pub fn parse_ui_dump(xml: &str) -> Vec<UiNode> {
    let bytes = xml.as_bytes();
    let mut nodes = Vec::new();
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] != b'<' {
            index += 1;
            continue;
        }
        let start = index + 1;
        let mut cursor = start;
        while cursor < bytes.len() {
            let ch = bytes[cursor];
            if ch == b'/' || ch == b'>' || ch.is_ascii_whitespace() {
                break;
            }
            cursor += 1;
        }
        let tag = &xml[start..cursor];
        let (attrs, end) = scan_attributes(xml, cursor);
        if tag == "node" {
            let find = |name: &str| {
                attrs
                    .iter()
                    .find(|(attr, _)| attr == name)
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default()
            };
            nodes.push(UiNode {
                resource_id: find("resource-id"),
                text: find("text"),
                content_desc: find("content-desc"),
                class: find("class"),
                bounds: Bounds::parse(&find("bounds")).unwrap_or_default(),
            });
        }
        index = end.max(index + 1);
    }
    nodes
}

/// Reads `name="value"` pairs up to the closing `>` of a tag.
fn scan_attributes(xml: &str, mut cursor: usize) -> (Vec<(String, String)>, usize) {
    let bytes = xml.as_bytes();
    let mut attrs = Vec::new();
    while cursor < bytes.len() {
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            break;
        }
        match bytes[cursor] {
            b'>' => return (attrs, cursor + 1),
            b'/' | b'?' => {
                cursor += 1;
                continue;
            }
            _ => {}
        }
        let name_start = cursor;
        while cursor < bytes.len()
            && bytes[cursor] != b'='
            && bytes[cursor] != b'>'
            && !bytes[cursor].is_ascii_whitespace()
        {
            cursor += 1;
        }
        let name = xml[name_start..cursor].to_string();
        if cursor >= bytes.len() || bytes[cursor] != b'=' {
            continue;
        }
        cursor += 1;
        let Some(&quote) = bytes.get(cursor) else {
            break;
        };
        if quote != b'"' && quote != b'\'' {
            continue;
        }
        cursor += 1;
        let value_start = cursor;
        while cursor < bytes.len() && bytes[cursor] != quote {
            cursor += 1;
        }
        attrs.push((name, unescape(&xml[value_start..cursor])));
        cursor = (cursor + 1).min(bytes.len());
    }
    (attrs, bytes.len())
}

fn unescape(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#10;", "\n")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?><hierarchy rotation="0"><node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.google.android.youtube" content-desc="" bounds="[0,0][1080,2340]"><node index="1" text="Tom &amp; Jerry" resource-id="com.google.android.youtube:id/title" class="android.widget.TextView" content-desc="Video &quot;title&quot;" bounds="[42,300][1038,380]" /></node></hierarchy>UI hierchary dumped to: /dev/tty"#;

    #[test]
    fn parses_nodes_in_document_order() {
        let nodes = parse_ui_dump(DUMP);
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].class, "android.widget.FrameLayout");
        let title = &nodes[1];
        assert_eq!(title.text, "Tom & Jerry");
        assert_eq!(title.content_desc, "Video \"title\"");
        assert!(title.has_id("title"));
        assert!(title.has_id("com.google.android.youtube:id/title"));
        assert!(!title.has_id("tit"));
        assert_eq!(title.bounds.center(), (540, 340));
    }

    #[test]
    fn tolerates_garbage() {
        assert!(parse_ui_dump("ERROR: null root node returned by UiTestAutomationBridge.").is_empty());
        assert!(parse_ui_dump("<node text=\"unterminated").len() <= 1);
        assert_eq!(Bounds::parse("[1,2]"), None);
    }
}
