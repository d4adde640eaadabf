//! Placeholder path parsing (`a.b[0].c`).

#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) enum Segment {
    Key(String),
    Index(usize),
}

/// Splits a placeholder path into segments, returning `None` when the path
/// is empty or malformed.
pub(super) fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                flush_key(&mut current, &mut segments)?;
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(Segment::Key(std::mem::take(&mut current)));
                }
                let mut inner = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == ']' {
                        closed = true;
                        break;
                    }
                    inner.push(next);
                }
                if !closed || inner.is_empty() {
                    return None;
                }
                segments.push(
                    inner
                        .parse::<usize>()
                        .map_or(Segment::Key(inner), Segment::Index),
                );
            }
            other => current.push(other),
        }
    }

    if !current.is_empty() {
        segments.push(Segment::Key(current));
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments)
}

fn flush_key(current: &mut String, segments: &mut Vec<Segment>) -> Option<()> {
    if current.is_empty() {
        // `a..b` or a leading dot; only valid directly after an index.
        return matches!(segments.last(), Some(Segment::Index(_))).then_some(());
    }
    segments.push(Segment::Key(std::mem::take(current)));
    Some(())
}
