//! Text helpers shared by the channel backends.

/// Cut `text` into pieces of at most `max_len` bytes for platforms that cap
/// message size.
///
/// Cuts land on char boundaries (course texts are mostly Cyrillic), right
/// after the last line break that fits when there is one. A char wider than
/// `max_len` goes out alone.
pub fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;

    while rest.len() > max_len {
        let mut cut = max_len;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        cut = match rest[..cut].rfind('\n') {
            Some(newline) => newline + 1,
            None if cut == 0 => rest.chars().next().map_or(rest.len(), char::len_utf8),
            None => cut,
        };
        let (piece, tail) = rest.split_at(cut);
        pieces.push(piece);
        rest = tail;
    }

    if !rest.is_empty() || pieces.is_empty() {
        pieces.push(rest);
    }
    pieces
}
