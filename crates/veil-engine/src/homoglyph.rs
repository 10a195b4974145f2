//! Name obfuscation through look-alike characters

/// Latin letters and their Cyrillic/Ukrainian counterparts
const HOMOGLYPHS: [(char, char); 16] = [
    ('A', '\u{0410}'),
    ('B', '\u{0412}'),
    ('C', '\u{0421}'),
    ('E', '\u{0415}'),
    ('I', '\u{0406}'),
    ('K', '\u{041A}'),
    ('M', '\u{041C}'),
    ('H', '\u{041D}'),
    ('O', '\u{041E}'),
    ('P', '\u{0420}'),
    ('T', '\u{0422}'),
    ('a', '\u{0430}'),
    ('e', '\u{0435}'),
    ('i', '\u{0456}'),
    ('o', '\u{043E}'),
    ('c', '\u{0441}'),
];

fn substitute(c: char) -> char {
    HOMOGLYPHS
        .iter()
        .find(|(latin, _)| *latin == c)
        .map_or(c, |(_, glyph)| *glyph)
}

/// Replace every substitutable letter of `name` with its look-alike.
///
/// Total and idempotent: the replacement characters are not themselves
/// substitutable.
pub fn apply_homoglyphs(name: &str) -> String {
    name.chars().map(substitute).collect()
}
