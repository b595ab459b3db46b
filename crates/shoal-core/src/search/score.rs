use strsim::normalized_levenshtein;

/// Token-set fuzzy similarity in `[0, 100]`.
///
/// Case-insensitive. An exact substring match short-circuits to 100;
/// otherwise each query token is matched against its best candidate token
/// and the per-token scores are averaged, so word order and filler words
/// in the candidate do not drag the score down.
pub fn fuzzy_score(query: &str, text: &str) -> f64 {
    let query = query.to_lowercase();
    let text = text.to_lowercase();
    if query.is_empty() || text.is_empty() {
        return 0.0;
    }
    if text.contains(&query) {
        return 100.0;
    }

    let query_tokens = tokenize(&query);
    let text_tokens = tokenize(&text);
    if query_tokens.is_empty() || text_tokens.is_empty() {
        return 0.0;
    }

    let mut total = 0.0;
    for query_token in &query_tokens {
        let mut best: f64 = 0.0;
        for text_token in &text_tokens {
            let similarity = token_similarity(query_token, text_token);
            if similarity > best {
                best = similarity;
            }
            if best >= 1.0 {
                break;
            }
        }
        total += best;
    }

    100.0 * total / query_tokens.len() as f64
}

fn token_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let edit = normalized_levenshtein(a, b);
    // A shared stem scores by length ratio, which edit distance already
    // approximates; take whichever view is more generous.
    let containment = if a.contains(b) || b.contains(a) {
        let (short, long) = if a.len() < b.len() { (a, b) } else { (b, a) };
        short.len() as f64 / long.len() as f64
    } else {
        0.0
    };
    edit.max(containment)
}

fn tokenize(s: &str) -> Vec<&str> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect()
}
