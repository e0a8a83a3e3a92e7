// Scrolling text shown over the visualizer.

pub const LINE_WIDTH: usize = 80;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayFields<'a> {
    pub title: &'a str,
    pub artist: Option<&'a str>,
    pub file_name: &'a str,
    pub comment: Option<&'a str>,
}

/// Build the overlay text: `Title:`, optional `Artist:`, `Filename:`, then the
/// comment block one source line at a time. Every output line ends in `\n`.
pub fn compose(fields: &OverlayFields<'_>, width: usize) -> String {
    let mut lines = vec![format!("Title: {}", fields.title)];
    if let Some(artist) = fields.artist.filter(|a| !a.trim().is_empty()) {
        lines.push(format!("Artist: {artist}"));
    }
    lines.push(format!("Filename: {}", fields.file_name));
    if let Some(comment) = fields.comment.filter(|c| !c.trim().is_empty()) {
        lines.push("Comments:".to_string());
        lines.extend(comment.lines().map(|l| l.trim_end().to_string()));
    }

    let mut out = String::new();
    for line in &lines {
        for wrapped in wrap_line(line, width) {
            out.push_str(&wrapped);
            out.push('\n');
        }
    }
    out
}

/// Greedy word wrap. Words are never split; a word wider than `width` gets a
/// line of its own. Leading indentation of the source line is preserved.
pub fn wrap_line(line: &str, width: usize) -> Vec<String> {
    if line.chars().count() <= width {
        return vec![line.to_string()];
    }

    let indent: String = line.chars().take_while(|c| *c == ' ').collect();
    let mut out = Vec::new();
    let mut current = indent.clone();
    let mut current_len = indent.chars().count();
    let mut has_word = false;

    for word in line.split(' ').filter(|w| !w.is_empty()) {
        let wlen = word.chars().count();
        if has_word && current_len + 1 + wlen > width {
            out.push(std::mem::take(&mut current));
            current_len = 0;
            has_word = false;
        }
        if has_word {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += wlen;
        has_word = true;
    }
    if has_word || out.is_empty() {
        out.push(current);
    }
    out
}
