//! Bounds inline content, cutting only at structurally safe points.

use crate::cache::CacheKey;
use safefetch_core::ResourceRef;
use serde::Serialize;

pub const TRUNCATION_MARKER: &str = "\n\n[... content truncated ...]";
/// Used when the limit is too small for [`TRUNCATION_MARKER`].
pub const SHORT_TRUNCATION_MARKER: &str = "[...]";
pub const RESOURCE_MIME_TYPE: &str = "text/markdown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitedContent {
    pub content: String,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_ref: Option<ResourceRef>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InlineLimiter {
    global: usize,
}

/// Smaller of two limits where 0 means unlimited; `None` when both are unlimited.
pub fn effective_limit(global: usize, per_call: Option<usize>) -> Option<usize> {
    match (global, per_call.unwrap_or(0)) {
        (0, 0) => None,
        (g, 0) => Some(g),
        (0, p) => Some(p),
        (g, p) => Some(g.min(p)),
    }
}

impl InlineLimiter {
    pub fn new(global: usize) -> Self {
        Self { global }
    }

    pub fn apply(
        &self,
        content: &str,
        cache_key: Option<&CacheKey>,
        limit_override: Option<usize>,
    ) -> LimitedContent {
        let Some(limit) = effective_limit(self.global, limit_override) else {
            return untouched(content);
        };
        if content.chars().count() <= limit {
            return untouched(content);
        }

        let resource_ref = cache_key.map(|k| ResourceRef {
            uri: k.uri(),
            mime_type: RESOURCE_MIME_TYPE.to_string(),
        });
        let marker_len = TRUNCATION_MARKER.chars().count();
        if limit < marker_len {
            return LimitedContent {
                content: SHORT_TRUNCATION_MARKER.chars().take(limit).collect(),
                truncated: true,
                resource_ref,
            };
        }
        let budget = limit - marker_len;
        // Shrink until the fence closer (if any) fits inside the budget too.
        let mut reserve = 0;
        let (head, closer) = loop {
            let (head, closer) = safe_prefix(content, budget.saturating_sub(reserve));
            let need = closer.as_ref().map_or(0, |c| c.chars().count());
            if need <= reserve {
                break (head, closer);
            }
            reserve = need;
        };

        let mut out = String::with_capacity(head.len() + marker_len + 8);
        out.push_str(head);
        if let Some(c) = closer {
            out.push_str(&c);
        }
        out.push_str(TRUNCATION_MARKER);

        LimitedContent {
            content: out,
            truncated: true,
            resource_ref,
        }
    }
}

fn untouched(content: &str) -> LimitedContent {
    LimitedContent {
        content: content.to_string(),
        truncated: false,
        resource_ref: None,
    }
}

/// First `budget` chars of `content`, pulled back out of any unterminated link, plus the text
/// needed to close a fence left open by the cut.
fn safe_prefix(content: &str, budget: usize) -> (&str, Option<String>) {
    let mut cut = content
        .char_indices()
        .nth(budget)
        .map_or(content.len(), |(i, _)| i);

    let head = &content[..cut];
    if let Some(open) = head.rfind('[') {
        if !link_is_closed(&head[open..]) {
            cut = open;
            if head[..open].ends_with('!') {
                cut -= 1;
            }
        }
    }

    let head = &content[..cut];
    let closer = open_fence(head).map(|fence| {
        if head.is_empty() || head.ends_with('\n') {
            fence
        } else {
            format!("\n{fence}")
        }
    });
    (head, closer)
}

/// `[text](target)` fully present in `s`, which starts at the `[`.
fn link_is_closed(s: &str) -> bool {
    match s.find("](") {
        Some(i) => s[i + 2..].contains(')'),
        None => false,
    }
}

/// The fence string still open at the end of `text`, if any.
pub fn open_fence(text: &str) -> Option<String> {
    let mut open: Option<String> = None;
    for line in text.lines() {
        let t = line.trim_start();
        let ch = match t.chars().next() {
            Some(c @ ('`' | '~')) => c,
            _ => continue,
        };
        let run = t.chars().take_while(|c| *c == ch).count();
        if run < 3 {
            continue;
        }
        match &open {
            None => open = Some(ch.to_string().repeat(run)),
            Some(f) if f.starts_with(ch) && run >= f.len() && t[run..].trim().is_empty() => {
                open = None
            }
            Some(_) => {}
        }
    }
    open
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NAMESPACE_MARKDOWN;
    use crate::config::SecurityConfig;
    use crate::url_guard::UrlGuard;
    use proptest::prelude::*;

    fn key() -> CacheKey {
        let u = UrlGuard::new(&SecurityConfig::default())
            .normalize("https://example.com/long")
            .unwrap();
        CacheKey::derive(NAMESPACE_MARKDOWN, &u, None)
    }

    #[test]
    fn limits_combine_as_smallest_positive() {
        assert_eq!(effective_limit(0, None), None);
        assert_eq!(effective_limit(0, Some(0)), None);
        assert_eq!(effective_limit(100, None), Some(100));
        assert_eq!(effective_limit(0, Some(40)), Some(40));
        assert_eq!(effective_limit(100, Some(40)), Some(40));
        assert_eq!(effective_limit(30, Some(40)), Some(30));
    }

    #[test]
    fn fitting_content_is_returned_unchanged() {
        let l = InlineLimiter::new(100);
        let r = l.apply("short", Some(&key()), None);
        assert_eq!(r.content, "short");
        assert!(!r.truncated);
        assert!(r.resource_ref.is_none());
    }

    #[test]
    fn truncation_appends_marker_and_points_at_cache() {
        let text = "word ".repeat(100);
        let r = InlineLimiter::new(80).apply(&text, Some(&key()), None);
        assert!(r.truncated);
        assert!(r.content.ends_with(TRUNCATION_MARKER));
        assert_eq!(r.content.chars().count(), 80);
        let rr = r.resource_ref.unwrap();
        assert_eq!(rr.uri, key().uri());
        assert_eq!(rr.mime_type, "text/markdown");

        let r = InlineLimiter::new(80).apply(&text, None, None);
        assert!(r.truncated && r.resource_ref.is_none());
    }

    #[test]
    fn open_fence_is_closed_before_marker() {
        let text = format!("intro\n```rust\n{}\n```\nafter", "let x = 1;\n".repeat(50));
        let r = InlineLimiter::new(120).apply(&text, None, None);
        assert!(r.truncated);
        assert!(open_fence(&r.content).is_none(), "{}", r.content);
        assert!(r.content.contains("\n```\n\n[... content truncated ...]"));
        assert!(r.content.chars().count() <= 120);
    }

    #[test]
    fn cut_never_lands_inside_a_link() {
        let text = format!(
            "{}see ![diagram](https://example.com/a/very/long/path.png) end",
            "a".repeat(40)
        );
        // Budget ends in the middle of the image target.
        let limit = 40 + 20 + TRUNCATION_MARKER.chars().count();
        let r = InlineLimiter::new(limit).apply(&text, None, None);
        let body = r.content.trim_end_matches(TRUNCATION_MARKER);
        assert_eq!(body, format!("{}see ", "a".repeat(40)));
    }

    #[test]
    fn complete_links_are_kept() {
        let text = format!("[ok](https://example.com) {}", "x".repeat(200));
        let r = InlineLimiter::new(60).apply(&text, None, None);
        assert!(r.content.starts_with("[ok](https://example.com) xx"));
    }

    #[test]
    fn tiny_limits_never_exceed_the_limit() {
        let text = "q".repeat(200);
        let r = InlineLimiter::new(10).apply(&text, Some(&key()), None);
        assert!(r.truncated);
        assert_eq!(r.content, SHORT_TRUNCATION_MARKER);
        assert!(r.resource_ref.is_some());

        let r = InlineLimiter::new(3).apply(&text, None, None);
        assert_eq!(r.content, "[..");
    }

    #[test]
    fn per_call_override_tightens_global() {
        let text = "z".repeat(500);
        let r = InlineLimiter::new(400).apply(&text, None, Some(100));
        assert_eq!(r.content.chars().count(), 100);
    }

    fn markdownish() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![
                Just("```".to_string()),
                Just("~~~~".to_string()),
                Just("[a link](https://example.com/x)".to_string()),
                Just("![img".to_string()),
                Just("plain text line".to_string()),
                "[a-z ]{0,30}",
            ],
            0..40,
        )
        .prop_map(|lines| lines.join("\n"))
    }

    proptest! {
        #[test]
        fn truncated_output_has_balanced_fences(text in markdownish(), limit in 1usize..400) {
            let r = InlineLimiter::new(limit).apply(&text, None, None);
            if r.truncated {
                prop_assert!(open_fence(&r.content).is_none());
                prop_assert!(r.content.chars().count() <= limit);
                if limit >= TRUNCATION_MARKER.chars().count() {
                    prop_assert!(r.content.ends_with(TRUNCATION_MARKER));
                }
            } else {
                prop_assert_eq!(r.content, text);
            }
        }
    }
}
