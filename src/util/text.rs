/// Remove emoji (pictographs, dingbats, flags, and their joiners/selectors) from `text`.
pub fn strip_emoji(text: &str) -> String {
    text.chars().filter(|c| !is_emoji(*c)).collect()
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF   // mahjong through pictographs extended-A, flags included
        | 0x2600..=0x27BF   // misc symbols, dingbats
        | 0x2300..=0x23FF   // misc technical: watch, hourglass, alarm clock, media keys
        | 0x2B00..=0x2BFF   // arrows, stars
        | 0x2934 | 0x2935
        | 0x25AA | 0x25AB | 0x25B6 | 0x25C0 | 0x25FB..=0x25FE
        | 0x203C | 0x2049   // double exclamation, exclamation question
        | 0x3030 | 0x303D   // wavy dash, part alternation mark
        | 0x3297 | 0x3299   // circled ideographs
        | 0xFE00..=0xFE0F   // variation selectors
        | 0x200D            // zero width joiner
        | 0x20E3            // combining keycap
        | 0xE0020..=0xE007F // tag sequences
    )
}

/// Emoji-stripped, whitespace-trimmed comment text.
pub fn normalize_comment(text: &str) -> String {
    let stripped = strip_emoji(text);
    stripped
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Short form of a long list for log lines: `A, B, C` or `A, ... , Z`.
pub fn ellipsize(items: &[String]) -> String {
    if items.len() < 6 {
        return items.join(", ");
    }
    format!("{}, ... , {}", items[0], items[items.len() - 1])
}

/// `1h 30m` style rendering of a duration.
pub fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    match (hours, minutes) {
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}
