// decode.rs
//
// Copyright (c) 2024 Junpei Kawamoto
//
// This software is released under the MIT License.
//
// http://opensource.org/licenses/mit-license.php

//! Logits processing for greedy decoding.

use std::collections::HashSet;

/// Applies the CTRL style repetition penalty to every token already generated.
pub fn apply_repetition_penalty(logits: &mut [f32], generated: &[i64], penalty: f32) {
    if penalty == 1.0 {
        return;
    }
    let seen: HashSet<i64> = generated.iter().copied().collect();
    for id in seen {
        if let Some(score) = usize::try_from(id).ok().and_then(|i| logits.get_mut(i)) {
            if *score > 0.0 {
                *score /= penalty;
            } else {
                *score *= penalty;
            }
        }
    }
}

/// Tokens that would complete an n-gram already present in `generated`.
pub fn banned_ngram_tokens(generated: &[i64], n: usize) -> Vec<i64> {
    if n == 0 || generated.len() + 1 < n {
        return Vec::new();
    }
    let prefix = &generated[generated.len() + 1 - n..];
    generated
        .windows(n)
        .filter(|w| w[..n - 1] == *prefix)
        .map(|w| w[n - 1])
        .collect()
}

pub fn ban_tokens(logits: &mut [f32], banned: &[i64]) {
    for &id in banned {
        if let Some(score) = usize::try_from(id).ok().and_then(|i| logits.get_mut(i)) {
            *score = f32::NEG_INFINITY;
        }
    }
}

/// Index of the largest logit. The first one wins on ties.
pub fn argmax(logits: &[f32]) -> Option<i64> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in logits.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if score <= b => {}
            _ => best = Some((i, score)),
        }
    }
    best.map(|(i, _)| i as i64)
}

/// Picks the next token from the logits of the last decoder position.
///
/// `never` lists tokens that must not be generated at all, such as padding.
pub fn next_token(
    logits: &mut [f32],
    generated: &[i64],
    never: &[i64],
    repetition_penalty: f32,
    no_repeat_ngram_size: usize,
) -> Option<i64> {
    ban_tokens(logits, never);
    apply_repetition_penalty(logits, generated, repetition_penalty);
    ban_tokens(logits, &banned_ngram_tokens(generated, no_repeat_ngram_size));
    argmax(logits).filter(|&id| logits[id as usize] > f32::NEG_INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_shrinks_seen_tokens_towards_zero() {
        let mut logits = vec![2.0, -2.0, 3.0];
        apply_repetition_penalty(&mut logits, &[0, 1, 1], 2.0);
        assert_eq!(logits, vec![1.0, -4.0, 3.0]);
    }

    #[test]
    fn penalty_ignores_out_of_range_ids() {
        let mut logits = vec![1.0];
        apply_repetition_penalty(&mut logits, &[-1, 5], 1.5);
        assert_eq!(logits, vec![1.0]);
    }

    #[test]
    fn trigram_repeats_are_banned() {
        // "a b c a b" must not continue with "c".
        let generated = [1, 2, 3, 1, 2];
        assert_eq!(banned_ngram_tokens(&generated, 3), vec![3]);
        assert!(banned_ngram_tokens(&[1, 2], 3).is_empty());
        assert!(banned_ngram_tokens(&generated, 0).is_empty());
    }

    #[test]
    fn unigram_size_bans_everything_seen() {
        let mut banned = banned_ngram_tokens(&[4, 5, 4], 1);
        banned.sort();
        assert_eq!(banned, vec![4, 4, 5]);
    }

    #[test]
    fn argmax_prefers_first_maximum_and_skips_nan() {
        assert_eq!(argmax(&[0.5, 2.0, 2.0]), Some(1));
        assert_eq!(argmax(&[f32::NAN, -1.0]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn next_token_avoids_banned_continuation() {
        let mut logits = vec![0.0, 0.1, 0.2, 5.0];
        let next = next_token(&mut logits, &[1, 3, 1], &[], 1.0, 2);
        // 3 would repeat the bigram (1, 3).
        assert_eq!(next, Some(2));
    }

    #[test]
    fn next_token_is_none_when_everything_is_banned() {
        let mut logits = vec![1.0, 2.0];
        assert_eq!(next_token(&mut logits, &[0, 1], &[], 1.0, 1), None);
    }

    #[test]
    fn padding_is_never_generated() {
        // Padding has the best score but is excluded outright.
        let mut logits = vec![0.5, 0.1, 9.0];
        assert_eq!(next_token(&mut logits, &[], &[2], 1.0, 3), Some(0));
    }
}
