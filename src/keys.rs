//! Character to `sendkey` token translation.

/// Translate one character into the token the emulator's `sendkey`
/// monitor command understands.
///
/// Characters without an entry are forwarded verbatim; lowercase letters
/// and digits are already valid tokens.
pub(crate) fn key_token(c: char) -> String {
    let token = match c {
        'A' => "shift-a",
        'B' => "shift-b",
        'C' => "shift-c",
        'D' => "shift-d",
        'E' => "shift-e",
        'F' => "shift-f",
        'G' => "shift-g",
        'H' => "shift-h",
        'I' => "shift-i",
        'J' => "shift-j",
        'K' => "shift-k",
        'L' => "shift-l",
        'M' => "shift-m",
        'N' => "shift-n",
        'O' => "shift-o",
        'P' => "shift-p",
        'Q' => "shift-q",
        'R' => "shift-r",
        'S' => "shift-s",
        'T' => "shift-t",
        'U' => "shift-u",
        'V' => "shift-v",
        'W' => "shift-w",
        'X' => "shift-x",
        'Y' => "shift-y",
        'Z' => "shift-z",
        '-' => "0x0C",
        '_' => "shift-0x0C",
        '=' => "0x0D",
        '+' => "shift-0x0D",
        '[' => "0x1A",
        '{' => "shift-0x1A",
        ']' => "0x1B",
        '}' => "shift-0x1B",
        ';' => "0x27",
        ':' => "shift-0x27",
        '\'' => "0x28",
        '"' => "shift-0x28",
        '`' => "0x29",
        '~' => "shift-0x29",
        '\\' => "0x2B",
        '|' => "shift-0x2B",
        ',' => "0x33",
        '<' => "shift-0x33",
        '.' => "0x34",
        '>' => "shift-0x34",
        '/' => "0x35",
        '?' => "shift-0x35",
        ' ' => "spc",
        '\n' => "ret",
        '!' => "shift-0x02",
        '@' => "shift-0x03",
        '#' => "shift-0x04",
        '$' => "shift-0x05",
        '%' => "shift-0x06",
        '^' => "shift-0x07",
        '&' => "shift-0x08",
        '*' => "shift-0x09",
        '(' => "shift-0x0A",
        ')' => "shift-0x0B",
        other => return other.to_string(),
    };
    token.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case('A', "shift-a")]
    #[case('-', "0x0C")]
    #[case('_', "shift-0x0C")]
    #[case('\n', "ret")]
    #[case(' ', "spc")]
    #[case('!', "shift-0x02")]
    #[case('"', "shift-0x28")]
    // Unmapped characters pass through untranslated.
    #[case('a', "a")]
    #[case('7', "7")]
    fn test_key_token(#[case] input: char, #[case] expected: &str) {
        assert_eq!(key_token(input), expected);
    }
}
