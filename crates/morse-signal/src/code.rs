//! ---
//! morse_section: "03-signal-rendering"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Encoding table, pulse timing and indicator playback."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
//! International Morse encoding table.
//!
//! Letters are separated by one space and words by three, so a decoded code
//! string maps directly onto gaps: each space adds two units of off-time on
//! top of the element gap, giving three units between letters and seven
//! between words.

/// Separator between the codes of two letters.
pub const LETTER_SEPARATOR: &str = " ";
/// Separator between two words.
pub const WORD_SEPARATOR: &str = "   ";

/// Code for a single character, `None` when the table has no entry.
pub fn lookup(ch: char) -> Option<&'static str> {
    let code = match ch.to_ascii_uppercase() {
        'A' => ".-",
        'B' => "-...",
        'C' => "-.-.",
        'D' => "-..",
        'E' => ".",
        'F' => "..-.",
        'G' => "--.",
        'H' => "....",
        'I' => "..",
        'J' => ".---",
        'K' => "-.-",
        'L' => ".-..",
        'M' => "--",
        'N' => "-.",
        'O' => "---",
        'P' => ".--.",
        'Q' => "--.-",
        'R' => ".-.",
        'S' => "...",
        'T' => "-",
        'U' => "..-",
        'V' => "...-",
        'W' => ".--",
        'X' => "-..-",
        'Y' => "-.--",
        'Z' => "--..",
        '0' => "-----",
        '1' => ".----",
        '2' => "..---",
        '3' => "...--",
        '4' => "....-",
        '5' => ".....",
        '6' => "-....",
        '7' => "--...",
        '8' => "---..",
        '9' => "----.",
        '.' => ".-.-.-",
        ',' => "--..--",
        '?' => "..--..",
        '\'' => ".----.",
        '!' => "-.-.--",
        '/' => "-..-.",
        '(' => "-.--.",
        ')' => "-.--.-",
        '&' => ".-...",
        ':' => "---...",
        ';' => "-.-.-.",
        '=' => "-...-",
        '+' => ".-.-.",
        '-' => "-....-",
        '_' => "..--.-",
        '"' => ".-..-.",
        '$' => "...-..-",
        '@' => ".--.-.",
        _ => return None,
    };
    Some(code)
}

/// Encode free text into a signal code.
///
/// Pure and total: characters without a table entry are dropped, runs of
/// whitespace collapse into a single word gap and words that encode to
/// nothing leave no gap behind.
pub fn encode(text: &str) -> String {
    text.split_whitespace()
        .filter_map(|word| {
            let letters: Vec<&str> = word.chars().filter_map(lookup).collect();
            (!letters.is_empty()).then(|| letters.join(LETTER_SEPARATOR))
        })
        .collect::<Vec<_>>()
        .join(WORD_SEPARATOR)
}
