use guidedb_core::chunker::count_tokens;
use guidedb_core::types::RetrievedPassage;

/// Keep the leading passages whose combined token count fits `budget`.
///
/// Stops at the first passage that would overflow; passages are never split.
pub fn fit_budget(passages: Vec<RetrievedPassage>, budget: usize) -> Vec<RetrievedPassage> {
    let mut used = 0;
    let mut out = Vec::with_capacity(passages.len());
    for p in passages {
        let tokens = count_tokens(&p.text);
        if used + tokens > budget {
            break;
        }
        used += tokens;
        out.push(p);
    }
    out
}

/// Render passages as prompt context for the chat layer.
pub fn format_context(passages: &[RetrievedPassage]) -> String {
    passages
        .iter()
        .map(|p| format!("From {} (relevance: {:.2}):\n{}\n", p.source, p.score, p.text))
        .collect::<Vec<_>>()
        .join("\n")
}
