// Dependency Tracking
// Static scan of an expression for the state paths it reads

use crate::expression::lexer::{Lexer, Token};

use std::collections::BTreeSet;

/// Return the distinct dotted state paths referenced by `expression`.
///
/// Operators, literals and keywords are ignored, as are function and method
/// names. A path stops at the first index access (`zones[0].occupied` reads
/// `zones`). Malformed input never fails: characters that do not lex are
/// skipped and whatever identifiers remain are reported.
pub fn extract_dependencies(expression: &str) -> BTreeSet<String> {
    let tokens = Lexer::new(expression).tokenize_lenient();
    let mut paths = BTreeSet::new();
    let mut i = 0;

    while i < tokens.len() {
        let Token::Identifier(name) = &tokens[i] else {
            i += 1;
            continue;
        };

        let previous = i.checked_sub(1).map(|p| &tokens[p]);
        let next = tokens.get(i + 1);

        // Member of a computed value: `(a).b`, `f(x).y`
        if matches!(previous, Some(Token::Dot)) {
            i += 1;
            continue;
        }

        // Function name
        if matches!(next, Some(Token::LParen)) {
            i += 1;
            continue;
        }

        // Object-literal key: `{ key: value }`
        if matches!(next, Some(Token::Colon))
            && matches!(previous, Some(Token::LBrace) | Some(Token::Comma))
        {
            i += 1;
            continue;
        }

        let mut path = name.clone();
        let mut j = i + 1;
        while let (Some(Token::Dot), Some(Token::Identifier(segment))) =
            (tokens.get(j), tokens.get(j + 1))
        {
            // `.method(` ends the path
            if matches!(tokens.get(j + 2), Some(Token::LParen)) {
                break;
            }
            path.push('.');
            path.push_str(segment);
            j += 2;
        }

        paths.insert(path);
        i = j;
    }

    paths
}
