//! Order-preserving deduplication by identity key.

use serde::Serialize;
use std::collections::HashSet;

/// Records with an identity key. Two records with equal keys are duplicates
/// no matter how their other fields differ.
pub trait Identity {
    fn identity(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupeStats {
    pub input_count: usize,
    pub output_count: usize,
    pub removed_count: usize,
}

/// Keep the first occurrence of every identity, in input order.
pub fn dedupe<T: Identity>(records: Vec<T>) -> (Vec<T>, DedupeStats) {
    let input_count = records.len();
    let mut seen: HashSet<String> = HashSet::with_capacity(input_count);
    let unique: Vec<T> = records
        .into_iter()
        .filter(|r| seen.insert(r.identity().to_string()))
        .collect();

    let stats = DedupeStats {
        input_count,
        output_count: unique.len(),
        removed_count: input_count - unique.len(),
    };
    (unique, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Rec {
        url: String,
        n: u32,
    }

    impl Identity for Rec {
        fn identity(&self) -> &str {
            &self.url
        }
    }

    fn rec(url: &str, n: u32) -> Rec {
        Rec { url: url.into(), n }
    }

    #[test]
    fn first_seen_wins() {
        let (out, stats) = dedupe(vec![rec("A", 1), rec("B", 2), rec("A", 3)]);
        assert_eq!(out, vec![rec("A", 1), rec("B", 2)]);
        assert_eq!(
            stats,
            DedupeStats {
                input_count: 3,
                output_count: 2,
                removed_count: 1
            }
        );
    }

    #[test]
    fn empty_input() {
        let (out, stats) = dedupe(Vec::<Rec>::new());
        assert!(out.is_empty());
        assert_eq!(stats.removed_count, 0);
    }

    proptest! {
        #[test]
        fn idempotent_and_shrinking(urls in proptest::collection::vec("[a-d]{1,2}", 0..40)) {
            let input: Vec<Rec> = urls.iter().enumerate().map(|(i, u)| rec(u, i as u32)).collect();
            let (once, stats) = dedupe(input.clone());
            let (twice, stats2) = dedupe(once.clone());

            prop_assert_eq!(&twice, &once);
            prop_assert_eq!(stats2.removed_count, 0);
            prop_assert!(once.len() <= input.len());
            prop_assert_eq!(stats.input_count, stats.output_count + stats.removed_count);

            // Survivors keep their relative order.
            let ns: Vec<u32> = once.iter().map(|r| r.n).collect();
            prop_assert!(ns.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
