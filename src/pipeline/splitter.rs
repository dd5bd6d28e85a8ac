//! Scene splitter: cut a screenplay into ordered chunks.
//!
//! Scene headings (`INT.`, `EXT.`, `INT/EXT.`, `EXT/INT.`, `INT./EXT.`) at the
//! start of a line open a new scene; each chunk runs from its heading to the
//! next one. Scripts without headings fall back to fixed-size chunks of about
//! `max_tokens` tokens (approximated as four characters per token).

use once_cell::sync::Lazy;
use regex::Regex;

/// One chunk of screenplay text, before it is attached to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptChunk {
    /// `S{n}` for scenes, `C{n}` for size-based chunks (1-based).
    pub id: String,
    /// 0-based, dense.
    pub index: usize,
    pub title: String,
    pub text: String,
}

static RE_SCENE_HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t]*(?:INT\./EXT\.|EXT\./INT\.|INT/EXT\.|EXT/INT\.|INT\.|EXT\.)[^\n]*$")
        .expect("scene heading regex is valid")
});

/// Split a script into scene chunks, or size-based chunks when no heading exists.
///
/// Blank chunks are dropped; indices stay dense and ids follow the indices.
pub fn split_scenes(script: &str, max_tokens: usize) -> Vec<ScriptChunk> {
    let headings: Vec<_> = RE_SCENE_HEADING.find_iter(script).collect();

    if headings.is_empty() {
        return split_by_size(script, max_tokens);
    }

    let mut chunks = Vec::with_capacity(headings.len());
    for (i, m) in headings.iter().enumerate() {
        let end = headings.get(i + 1).map(|n| n.start()).unwrap_or(script.len());
        let text = script[m.start()..end].trim();
        if text.is_empty() {
            continue;
        }
        let index = chunks.len();
        chunks.push(ScriptChunk {
            id: format!("S{}", index + 1),
            index,
            title: m.as_str().trim().to_string(),
            text: text.to_string(),
        });
    }
    chunks
}

fn split_by_size(script: &str, max_tokens: usize) -> Vec<ScriptChunk> {
    let max_chars = max_tokens.max(1).saturating_mul(4);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < script.len() {
        let mut end = (start + max_chars).min(script.len());
        while !script.is_char_boundary(end) {
            end += 1;
        }
        let text = script[start..end].trim();
        if !text.is_empty() {
            let index = chunks.len();
            chunks.push(ScriptChunk {
                id: format!("C{}", index + 1),
                index,
                title: format!("Chunk {}", index + 1),
                text: text.to_string(),
            });
        }
        start = end;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_scene_headings() {
        let script = "INT. KITCHEN - DAY\nJohn walks into the kitchen.\n\nEXT. STREET - NIGHT\nA car drives away.";
        let chunks = split_scenes(script, 3000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, "S1");
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].title, "INT. KITCHEN - DAY");
        assert!(chunks[0].text.contains("John walks"));
        assert!(!chunks[0].text.contains("A car"));
        assert_eq!(chunks[1].id, "S2");
        assert_eq!(chunks[1].title, "EXT. STREET - NIGHT");
    }

    #[test]
    fn headings_are_case_insensitive_and_mixed() {
        let script = "int. car - moving\nHonk.\nINT./EXT. PORCH - DUSK\nCreak.\nEXT/INT. BARN\nMoo.";
        let titles: Vec<_> = split_scenes(script, 3000).into_iter().map(|c| c.title).collect();
        assert_eq!(titles, vec!["int. car - moving", "INT./EXT. PORCH - DUSK", "EXT/INT. BARN"]);
    }

    #[test]
    fn preamble_before_first_heading_is_ignored() {
        let script = "TITLE PAGE\nby Someone\n\nINT. OFFICE - DAY\nTyping.";
        let chunks = split_scenes(script, 3000);
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].text.contains("TITLE PAGE"));
    }

    #[test]
    fn falls_back_to_size_chunks() {
        let script = "Ala has a cat. ".repeat(1000);
        let chunks = split_scenes(&script, 100);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].id, "C1");
        assert_eq!(chunks[0].title, "Chunk 1");
        assert!(chunks.iter().all(|c| c.text.len() <= 400));
        assert!(chunks.iter().enumerate().all(|(i, c)| c.index == i));
    }

    #[test]
    fn size_chunks_respect_char_boundaries() {
        let script = "ł".repeat(10);
        let chunks = split_scenes(&script, 1);
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, script);
    }

    #[test]
    fn empty_script_has_no_chunks() {
        assert!(split_scenes("", 3000).is_empty());
        assert!(split_scenes("   \n\n  ", 3000).is_empty());
    }
}
