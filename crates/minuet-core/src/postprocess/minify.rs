//! Single-pass minifiers for CSS, JS and HTML bodies.
//!
//! These operate on raw bytes and never grow the input: comments collapse
//! to nothing or one separating space, whitespace runs shrink to at most
//! one byte. Output is only adopted by the caller when strictly shorter.

fn is_space(c: u8) -> bool {
    matches!(c, b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r' | b' ')
}

fn css_is_punct(c: u8) -> bool {
    matches!(
        c,
        b',' | b';'
            | b':'
            | b'{'
            | b'}'
            | b')'
            | b'('
            | b'>'
            | b'+'
            | b'~'
            | b'*'
            | b'='
            | b'['
            | b']'
            | b'|'
            | b'!'
            | b'&'
            | b'^'
            | b'%'
            | b'#'
            | b'.'
    )
}

fn js_is_punct(c: u8) -> bool {
    matches!(
        c,
        b'(' | b')'
            | b'['
            | b']'
            | b'{'
            | b'}'
            | b','
            | b';'
            | b':'
            | b'?'
            | b'+'
            | b'-'
            | b'*'
            | b'%'
            | b'&'
            | b'|'
            | b'^'
            | b'!'
            | b'='
            | b'<'
            | b'>'
            | b'~'
            | b'/'
            | b'.'
    )
}

fn js_is_ident(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

/// A `/` starts a regex literal when the last significant byte leaves an
/// expression position open.
fn js_regex_prefix(c: u8) -> bool {
    matches!(
        c,
        0 | b'(' | b'=' | b':' | b',' | b'?' | b'!' | b'&' | b'|' | b'^' | b'%' | b'+' | b'-'
            | b'~'
            | b'{'
            | b'}'
            | b'['
            | b';'
    )
}

pub fn minify_css(input: &[u8]) -> Vec<u8> {
    let len = input.len();
    let mut out: Vec<u8> = Vec::with_capacity(len);
    let mut in_comment = false;
    let mut last_space = false;

    let mut i = 0;
    while i < len {
        let c = input[i];
        let next = if i + 1 < len { input[i + 1] } else { 0 };

        if in_comment {
            if c == b'*' && next == b'/' {
                in_comment = false;

                // A comment may be the only separator between two tokens or
                // around a +/- operator; keep one space in that case.
                let prev = out
                    .iter()
                    .rev()
                    .copied()
                    .find(|&b| !is_space(b))
                    .unwrap_or(0);
                let mut k = i + 2;
                while k < len && is_space(input[k]) {
                    k += 1;
                }
                let right = if k < len { input[k] } else { 0 };

                let need_space = (!css_is_punct(prev) && !css_is_punct(right))
                    || right == b'+'
                    || right == b'-'
                    || prev == b'+'
                    || prev == b'-';

                if need_space && out.last() != Some(&b' ') {
                    out.push(b' ');
                    last_space = true;
                }
                i += 1;
            }
            i += 1;
            continue;
        }
        if c == b'/' && next == b'*' {
            in_comment = true;
            i += 2;
            continue;
        }

        if is_space(c) {
            if last_space {
                i += 1;
                continue;
            }
            let prev = out.last().copied().unwrap_or(0);
            let mut k = i + 1;
            let mut next_non = 0;
            while k < len {
                if !is_space(input[k]) {
                    next_non = input[k];
                    break;
                }
                k += 1;
            }
            if out.is_empty()
                || prev == b':'
                || prev == b','
                || prev == b';'
                || prev == b'\n'
                || prev == b'\r'
                || prev == b'\t'
            {
                i = k.max(i + 1);
                continue;
            }
            if css_is_punct(prev) || css_is_punct(next_non) {
                i = k.max(i + 1);
                continue;
            }
            out.push(b' ');
            last_space = true;
            i = k.max(i + 1);
            continue;
        }

        if c == b':' || c == b';' {
            while matches!(out.last(), Some(b' ') | Some(b'\n') | Some(b'\t') | Some(b'\r')) {
                out.pop();
            }
        }
        if last_space && matches!(c, b'}' | b'{' | b';' | b',') && out.last() == Some(&b' ') {
            out.pop();
        }
        out.push(c);
        last_space = false;
        i += 1;
    }

    out
}

pub fn minify_js(input: &[u8]) -> Vec<u8> {
    let len = input.len();
    let mut out: Vec<u8> = Vec::with_capacity(len);
    let mut in_string = false;
    let mut string_quote = 0u8;
    let mut in_regex = false;
    let mut in_single_comment = false;
    let mut in_multi_comment = false;
    let mut prev_sig = 0u8;

    let mut i = 0;
    while i < len {
        let c = input[i];
        let next = if i + 1 < len { input[i + 1] } else { 0 };

        if in_single_comment {
            if c == b'\n' || c == b'\r' {
                in_single_comment = false;
                // The terminating newline is reprocessed as plain
                // whitespace so it collapses by the normal rules.
                continue;
            }
            i += 1;
            continue;
        }
        if in_multi_comment {
            if c == b'*' && next == b'/' {
                in_multi_comment = false;

                // Keep the two sides apart when the comment separated
                // identifiers.
                let mut k = i + 2;
                while k < len && is_space(input[k]) {
                    k += 1;
                }
                let right = if k < len { input[k] } else { 0 };
                if js_is_ident(prev_sig) && js_is_ident(right) {
                    if out.last() != Some(&b' ') {
                        out.push(b' ');
                    }
                    prev_sig = b' ';
                }
                i += 1;
            }
            i += 1;
            continue;
        }
        if in_string {
            out.push(c);
            if c == b'\\' && i + 1 < len {
                i += 1;
                out.push(input[i]);
            } else if c == string_quote {
                in_string = false;
                prev_sig = string_quote;
            }
            i += 1;
            continue;
        }
        if in_regex {
            out.push(c);
            if c == b'\\' && i + 1 < len {
                i += 1;
                out.push(input[i]);
                i += 1;
                continue;
            }
            if c == b'/' {
                in_regex = false;
                prev_sig = b'/';
            }
            i += 1;
            continue;
        }

        if c == b'\'' || c == b'"' || c == b'`' {
            in_string = true;
            string_quote = c;
            out.push(c);
            i += 1;
            continue;
        }

        if c == b'/' && next == b'/' {
            in_single_comment = true;
            i += 2;
            continue;
        }
        if c == b'/' && next == b'*' {
            in_multi_comment = true;
            i += 2;
            continue;
        }
        if c == b'/' && js_regex_prefix(prev_sig) {
            in_regex = true;
            out.push(c);
            prev_sig = 0;
            i += 1;
            continue;
        }

        if is_space(c) {
            let mut k = i + 1;
            while k < len && is_space(input[k]) {
                k += 1;
            }
            let next_non = if k < len { input[k] } else { 0 };
            if out.is_empty() {
                i = k;
                continue;
            }
            if js_is_punct(prev_sig) || js_is_punct(next_non) {
                i = k;
                continue;
            }
            out.push(b' ');
            prev_sig = b' ';
            i = k;
            continue;
        }

        out.push(c);
        prev_sig = c;
        i += 1;
    }

    while matches!(out.last(), Some(b' ') | Some(b'\n') | Some(b'\r') | Some(b'\t')) {
        out.pop();
    }
    out
}

fn is_preserve_tag(name: &[u8]) -> bool {
    name.eq_ignore_ascii_case(b"pre")
        || name.eq_ignore_ascii_case(b"textarea")
        || name.eq_ignore_ascii_case(b"script")
        || name.eq_ignore_ascii_case(b"style")
}

pub fn minify_html(input: &[u8]) -> Vec<u8> {
    let len = input.len();
    let mut out: Vec<u8> = Vec::with_capacity(len);
    let mut preserve_depth = 0usize;

    let mut i = 0;
    while i < len {
        let c = input[i];

        if c == b'<' {
            // Comments vanish entirely (outside preserved content).
            if preserve_depth == 0
                && i + 3 < len
                && input[i + 1] == b'!'
                && input[i + 2] == b'-'
                && input[i + 3] == b'-'
            {
                i += 4;
                while i + 2 < len
                    && !(input[i] == b'-' && input[i + 1] == b'-' && input[i + 2] == b'>')
                {
                    i += 1;
                }
                if i + 2 < len {
                    i += 3;
                } else {
                    i = len;
                }
                continue;
            }

            let tag_start = i;
            let mut j = i + 1;
            let mut closing = false;
            if j < len && input[j] == b'/' {
                closing = true;
                j += 1;
            }
            while j < len && is_space(input[j]) {
                j += 1;
            }
            let name_start = j;
            while j < len
                && (input[j].is_ascii_alphanumeric() || input[j] == b'-' || input[j] == b':')
            {
                j += 1;
            }
            let preserve_tag = j > name_start && is_preserve_tag(&input[name_start..j]);

            if preserve_depth > 0 && !preserve_tag && !closing {
                out.push(c);
                i += 1;
                continue;
            }

            // Inside the tag: normalize whitespace between attributes, but
            // leave quoted values alone.
            let mut k = tag_start;
            let mut in_quote = false;
            let mut quote = 0u8;
            let mut wrote_space = false;
            while k < len {
                let ch = input[k];
                out.push(ch);
                if ch == b'\'' || ch == b'"' {
                    if in_quote && quote == ch {
                        in_quote = false;
                    } else if !in_quote {
                        in_quote = true;
                        quote = ch;
                    }
                    wrote_space = false;
                } else if !in_quote && is_space(ch) {
                    if wrote_space {
                        out.pop();
                        k += 1;
                        continue;
                    }
                    wrote_space = true;
                    let last = out.len() - 1;
                    out[last] = b' ';
                } else if !in_quote && ch == b'>' {
                    if closing && preserve_tag && preserve_depth > 0 {
                        preserve_depth -= 1;
                    } else if !closing && preserve_tag {
                        preserve_depth += 1;
                    }
                    break;
                } else if !is_space(ch) {
                    wrote_space = false;
                }
                k += 1;
            }
            i = k + 1;
            continue;
        }

        if preserve_depth > 0 {
            out.push(c);
            i += 1;
            continue;
        }

        if is_space(c) {
            let mut k = i + 1;
            while k < len && is_space(input[k]) {
                k += 1;
            }
            let prev = out.last().copied().unwrap_or(0);
            let next = if k < len { input[k] } else { 0 };
            // Whitespace that only separates tags (or leads/trails the
            // document) disappears; inter-word whitespace collapses to one
            // space so rendered text keeps its spacing.
            if prev == b'>' || prev == 0 || next == b'<' || next == 0 {
                i = k;
                continue;
            }
            out.push(b' ');
            i = k;
            continue;
        }

        out.push(c);
        i += 1;
    }

    while matches!(out.last(), Some(&b) if is_space(b)) {
        out.pop();
    }
    out
}

/// Content-type driven dispatch; returns `None` for non-minifiable types.
pub fn minify(content_type: &str, input: &[u8]) -> Option<Vec<u8>> {
    if input.is_empty() {
        return None;
    }
    let ct = content_type.to_ascii_lowercase();
    if ct.contains("text/html") || ct.contains("application/xhtml") {
        Some(minify_html(input))
    } else if ct.contains("text/css") {
        Some(minify_css(input))
    } else if ct.contains("javascript") {
        Some(minify_js(input))
    } else {
        None
    }
}
