//! URL extraction and in-place substitution for `srcset` strings.
//!
//! A URL starts at `http://` or `https://` inside a whitespace-delimited
//! token and runs to the end of that token, minus a trailing candidate
//! separator comma. Descriptors (`2x`, `600w`) and separators are preserved
//! when URLs are substituted.

/// Every absolute URL in `srcset`, in order.
pub fn extract_urls(srcset: &str) -> Vec<&str> {
    tokens(srcset)
        .filter_map(|token| url_span(token).map(|(start, end)| &token[start..end]))
        .collect()
}

/// Rewrites each URL for which `replace` returns a value. Returns `None` when
/// nothing changed, so callers can skip the write.
pub fn substitute_urls<F>(srcset: &str, mut replace: F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(srcset.len());
    let mut changed = false;
    let mut rest = srcset;

    while !rest.is_empty() {
        let token_len = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let (token, tail) = rest.split_at(token_len);
        match url_span(token).and_then(|(start, end)| {
            replace(&token[start..end])
                .filter(|next| next != &token[start..end])
                .map(|next| (start, end, next))
        }) {
            Some((start, end, next)) => {
                out.push_str(&token[..start]);
                out.push_str(&next);
                out.push_str(&token[end..]);
                changed = true;
            }
            None => out.push_str(token),
        }

        let space_len = tail
            .find(|ch: char| !ch.is_whitespace())
            .unwrap_or(tail.len());
        out.push_str(&tail[..space_len]);
        rest = &tail[space_len..];
    }

    changed.then_some(out)
}

fn tokens(srcset: &str) -> impl Iterator<Item = &str> {
    srcset.split_whitespace()
}

fn url_span(token: &str) -> Option<(usize, usize)> {
    let start = [token.find("http://"), token.find("https://")]
        .into_iter()
        .flatten()
        .min()?;
    let end = if token.ends_with(',') {
        token.len() - 1
    } else {
        token.len()
    };
    (end > start).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::{extract_urls, substitute_urls};

    #[test]
    fn extracts_urls_with_descriptors_and_separators() {
        assert_eq!(
            extract_urls("https://a.test/s.jpg 1x, https://a.test/l.jpg 2x"),
            vec!["https://a.test/s.jpg", "https://a.test/l.jpg"]
        );
        assert_eq!(
            extract_urls("  http://a.test/one.jpg\n"),
            vec!["http://a.test/one.jpg"]
        );
    }

    #[test]
    fn relative_or_empty_srcset_yields_nothing() {
        assert!(extract_urls("").is_empty());
        assert!(extract_urls("/img/a.jpg 1x, /img/b.jpg 2x").is_empty());
    }

    #[test]
    fn substitutes_each_match_in_place() {
        let out = substitute_urls(
            "https://a.test/s.jpg 600w,\nhttps://a.test/l.jpg 1200w",
            |url| (url == "https://a.test/l.jpg").then(|| "https://gen.test/l.png".to_string()),
        );
        assert_eq!(
            out.as_deref(),
            Some("https://a.test/s.jpg 600w,\nhttps://gen.test/l.png 1200w")
        );
    }

    #[test]
    fn unchanged_substitution_reports_none() {
        assert_eq!(substitute_urls("https://a.test/s.jpg 1x", |_| None), None);
        assert_eq!(
            substitute_urls("https://a.test/s.jpg", |url| Some(url.to_string())),
            None
        );
        assert_eq!(substitute_urls("/relative.jpg", |_| Some("x".to_string())), None);
    }
}
