//! Component N: the ESI (Edge-Side-Includes) parser and the data it
//! produces for delivery-time expansion (§4.5).
//!
//! The parser runs during fetch, token-scanning the body for
//! `<esi:include src="...">`, `<esi:remove>...</esi:remove>`,
//! `<!--esi ...-->`, and CDATA, producing an ordered list of fragments
//! stored alongside the object. Delivery-time expansion (re-entering the
//! state machine per include) lives in [`crate::deliver`] since it needs
//! the running session, not just the parsed program.
//!
//! There is no single `cache_esi_parse.c` in this tree; grounded instead on
//! `bin/varnishd/cache_esi.c` (the parse/build side) and `cache_esi_fetch.c`
//! (the fetch-time VFP that invokes it), written here as a single-pass byte
//! scanner over `&[u8]` rather than pulling in an XML crate — §4.5 describes
//! ESI as XML-ish token scanning, not a conformant XML document, and
//! hand-rolled parsing fits that spirit.

use bytes::Bytes;

/// One piece of a parsed ESI program (§4.5: "an ordered list of
/// `(verbatim-bytes | include{host, url})` fragments").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EsiFragment {
    Verbatim(Bytes),
    Include { url: Bytes },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsiProgram {
    pub fragments: Vec<EsiFragment>,
}

impl EsiProgram {
    pub fn include_count(&self) -> usize {
        self.fragments.iter().filter(|f| matches!(f, EsiFragment::Include { .. })).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EsiParseWarning {
    /// a construct didn't parse; the offending bytes are kept verbatim and
    /// scanning continues (§7: "the offending construct is treated as
    /// verbatim text; processing continues").
    Malformed,
}

/// Parses `body` into an [`EsiProgram`]. Never fails outright: per §7,
/// parse errors in ESI are logged warnings and the offending bytes are
/// kept as plain verbatim content, so the return is always a program, with
/// any warnings collected alongside for the caller to log.
pub fn parse(body: &[u8]) -> (EsiProgram, Vec<EsiParseWarning>) {
    let mut fragments = Vec::new();
    let mut warnings = Vec::new();
    let mut verbatim_start = 0usize;
    let mut i = 0usize;

    while i < body.len() {
        if body[i..].starts_with(b"<esi:include") {
            if let Some((src, consumed)) = parse_include_tag(&body[i..]) {
                flush_verbatim(&mut fragments, body, verbatim_start, i);
                fragments.push(EsiFragment::Include { url: Bytes::copy_from_slice(src) });
                i += consumed;
                verbatim_start = i;
                continue;
            }
            warnings.push(EsiParseWarning::Malformed);
            i += 1;
            continue;
        }
        if body[i..].starts_with(b"<esi:remove>") {
            if let Some(end) = find_subsequence(&body[i..], b"</esi:remove>") {
                flush_verbatim(&mut fragments, body, verbatim_start, i);
                i += end + b"</esi:remove>".len();
                verbatim_start = i;
                continue;
            }
            warnings.push(EsiParseWarning::Malformed);
            i += 1;
            continue;
        }
        if body[i..].starts_with(b"<!--esi") {
            if let Some(end) = find_subsequence(&body[i..], b"-->") {
                // <!--esi ... --> uncomments to its inner content verbatim.
                flush_verbatim(&mut fragments, body, verbatim_start, i);
                let inner = &body[i + b"<!--esi".len()..i + end];
                fragments.push(EsiFragment::Verbatim(Bytes::copy_from_slice(inner)));
                i += end + b"-->".len();
                verbatim_start = i;
                continue;
            }
            warnings.push(EsiParseWarning::Malformed);
            i += 1;
            continue;
        }
        if body[i..].starts_with(b"<![CDATA[") {
            if let Some(end) = find_subsequence(&body[i..], b"]]>") {
                flush_verbatim(&mut fragments, body, verbatim_start, i);
                let inner = &body[i + b"<![CDATA[".len()..i + end];
                fragments.push(EsiFragment::Verbatim(Bytes::copy_from_slice(inner)));
                i += end + b"]]>".len();
                verbatim_start = i;
                continue;
            }
            warnings.push(EsiParseWarning::Malformed);
            i += 1;
            continue;
        }
        i += 1;
    }
    flush_verbatim(&mut fragments, body, verbatim_start, body.len());
    (EsiProgram { fragments }, warnings)
}

fn flush_verbatim(fragments: &mut Vec<EsiFragment>, body: &[u8], start: usize, end: usize) {
    if end > start {
        fragments.push(EsiFragment::Verbatim(Bytes::copy_from_slice(&body[start..end])));
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extracts `src="..."` from an `<esi:include .../>` or `<esi:include ...>`
/// tag starting at `tag[0..]`. Returns the attribute value and the number
/// of bytes consumed (through the tag's closing `>`).
fn parse_include_tag(tag: &[u8]) -> Option<(&[u8], usize)> {
    let close = tag.iter().position(|&b| b == b'>')?;
    let head = &tag[..close];
    let src_marker = b"src=\"";
    let src_pos = find_subsequence(head, src_marker)?;
    let value_start = src_pos + src_marker.len();
    let value_end = head[value_start..].iter().position(|&b| b == b'"')? + value_start;
    Some((&head[value_start..value_end], close + 1))
}

/// Resolves an include's `src` against the backend request URL, per §4.5:
/// relative includes resolve against the *backend* request's URL, not the
/// client's original URL. Absolute (`http://` or `/`-rooted) URLs are
/// returned unchanged.
pub fn resolve_include_url(backend_url: &[u8], src: &[u8]) -> Bytes {
    if src.starts_with(b"/") || src.starts_with(b"http://") || src.starts_with(b"https://") {
        return Bytes::copy_from_slice(src);
    }
    let base_dir = match backend_url.iter().rposition(|&b| b == b'/') {
        Some(pos) => &backend_url[..=pos],
        None => b"/",
    };
    let mut out = Vec::with_capacity(base_dir.len() + src.len());
    out.extend_from_slice(base_dir);
    out.extend_from_slice(src);
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_include_between_verbatim() {
        let body = b"A<esi:include src=\"/child\"/>B";
        let (program, warnings) = parse(body);
        assert!(warnings.is_empty());
        assert_eq!(
            program.fragments,
            vec![
                EsiFragment::Verbatim(Bytes::from_static(b"A")),
                EsiFragment::Include { url: Bytes::from_static(b"/child") },
                EsiFragment::Verbatim(Bytes::from_static(b"B")),
            ]
        );
    }

    #[test]
    fn esi_remove_block_is_stripped() {
        let body = b"A<esi:remove>ignored</esi:remove>B";
        let (program, _) = parse(body);
        assert_eq!(
            program.fragments,
            vec![Bytes::from_static(b"A"), Bytes::from_static(b"B")]
                .into_iter()
                .map(EsiFragment::Verbatim)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn html_comment_esi_uncomments_to_verbatim() {
        let body = b"<!--esi <b>shown</b>-->";
        let (program, _) = parse(body);
        assert_eq!(program.fragments, vec![EsiFragment::Verbatim(Bytes::from_static(b" <b>shown</b>"))]);
    }

    #[test]
    fn unterminated_include_is_malformed_but_continues() {
        let body = b"A<esi:include src=\"/child\"B";
        let (_, warnings) = parse(body);
        assert_eq!(warnings, vec![EsiParseWarning::Malformed]);
    }

    #[test]
    fn relative_include_resolves_against_backend_url() {
        let resolved = resolve_include_url(b"/dir/parent.html", b"child.html");
        assert_eq!(resolved.as_ref(), b"/dir/child.html");
    }

    #[test]
    fn absolute_include_is_unchanged() {
        let resolved = resolve_include_url(b"/dir/parent.html", b"/other/child.html");
        assert_eq!(resolved.as_ref(), b"/other/child.html");
    }
}
