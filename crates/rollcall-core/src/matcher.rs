use crate::gallery::Gallery;
use crate::types::{Embedding, Identity};

/// Result of matching a query embedding against the gallery.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Identified {
        identity: Identity,
        distance: f32,
        /// Index of the winning gallery entry.
        entry: usize,
    },
    /// No entry was close enough. `distance` is the best distance seen,
    /// `None` when there was nothing to compare against.
    Unknown { distance: Option<f32> },
}

impl MatchResult {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            MatchResult::Identified { identity, .. } => Some(identity),
            MatchResult::Unknown { .. } => None,
        }
    }

    pub fn distance(&self) -> Option<f32> {
        match self {
            MatchResult::Identified { distance, .. } => Some(*distance),
            MatchResult::Unknown { distance } => *distance,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, MatchResult::Identified { .. })
    }
}

/// Strategy for comparing a probe embedding against the gallery.
pub trait Matcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult;

    /// Match every face of one frame against the same gallery.
    fn compare_all(&self, probes: &[&Embedding], gallery: &Gallery, threshold: f32) -> Vec<MatchResult> {
        probes
            .iter()
            .map(|probe| self.compare(probe, gallery, threshold))
            .collect()
    }
}

/// Nearest neighbour by Euclidean distance over every gallery entry.
///
/// The first entry wins ties. A match requires `distance < threshold`;
/// lower thresholds are stricter.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Embedding, gallery: &Gallery, threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, (_, embedding)) in gallery.iter().enumerate() {
            let d = probe.euclidean_distance(embedding);
            // Strict `<` keeps the earliest entry on ties; NaN never wins.
            if best.map_or(!d.is_nan(), |(_, best_d)| d < best_d) {
                best = Some((i, d));
            }
        }

        match best {
            Some((entry, distance)) if distance < threshold => MatchResult::Identified {
                identity: gallery.entries()[entry].identity.clone(),
                distance,
                entry,
            },
            Some((_, distance)) => MatchResult::Unknown {
                distance: Some(distance),
            },
            None => MatchResult::Unknown { distance: None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryEntry;

    fn gallery(entries: &[(&str, Vec<f32>)]) -> Gallery {
        Gallery::new(
            entries
                .iter()
                .map(|(name, v)| GalleryEntry {
                    identity: (*name).into(),
                    embedding: Embedding::new(v.clone()),
                })
                .collect(),
        )
        .unwrap()
    }

    /// Alice at the origin, Bob at (1.1, 0).
    fn alice_bob() -> Gallery {
        gallery(&[("Alice", vec![0.0, 0.0]), ("Bob", vec![1.1, 0.0])])
    }

    #[test]
    fn test_closest_identity_within_threshold() {
        // 0.2 from Alice, 0.9 from Bob
        let probe = Embedding::new(vec![0.2, 0.0]);
        let result = EuclideanMatcher.compare(&probe, &alice_bob(), 0.45);
        assert_eq!(result.identity().map(|i| i.as_str()), Some("Alice"));
        assert!((result.distance().unwrap() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_nearest_beyond_threshold_is_unknown() {
        // 0.5 from Alice, 0.6 from Bob
        let probe = Embedding::new(vec![0.5, 0.0]);
        let result = EuclideanMatcher.compare(&probe, &alice_bob(), 0.45);
        assert!(!result.is_match());
        assert!((result.distance().unwrap() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_boundary_is_strict() {
        let g = gallery(&[("Alice", vec![0.0])]);
        let probe = Embedding::new(vec![0.5]);
        assert!(!EuclideanMatcher.compare(&probe, &g, 0.5).is_match());
        assert!(EuclideanMatcher.compare(&probe, &g, 0.5001).is_match());
    }

    #[test]
    fn test_threshold_monotonic() {
        let g = alice_bob();
        let probe = Embedding::new(vec![0.25, 0.0]);
        let strict = EuclideanMatcher.compare(&probe, &g, 0.25);
        let loose = EuclideanMatcher.compare(&probe, &g, 0.26);
        assert!(!strict.is_match());
        assert!(loose.is_match());
    }

    #[test]
    fn test_empty_gallery_is_unknown() {
        let probe = Embedding::new(vec![1.0, 0.0]);
        let result = EuclideanMatcher.compare(&probe, &Gallery::empty(), 10.0);
        assert_eq!(result, MatchResult::Unknown { distance: None });
    }

    #[test]
    fn test_tie_resolves_to_first_entry() {
        let g = gallery(&[("Left", vec![-1.0]), ("Right", vec![1.0])]);
        let result = EuclideanMatcher.compare(&Embedding::new(vec![0.0]), &g, 2.0);
        assert_eq!(result.identity().map(|i| i.as_str()), Some("Left"));
        assert!(matches!(result, MatchResult::Identified { entry: 0, .. }));
    }

    #[test]
    fn test_matches_any_entry_of_multi_image_identity() {
        // Bob's second image is the close one; no centroid averaging.
        let g = gallery(&[
            ("Bob", vec![5.0, 5.0]),
            ("Alice", vec![0.0, 0.0]),
            ("Bob", vec![2.0, 2.0]),
        ]);
        let result = EuclideanMatcher.compare(&Embedding::new(vec![2.1, 2.0]), &g, 0.45);
        assert!(matches!(result, MatchResult::Identified { entry: 2, .. }));
        assert_eq!(result.identity().map(|i| i.as_str()), Some("Bob"));
    }

    #[test]
    fn test_compare_all_preserves_order() {
        let g = alice_bob();
        let a = Embedding::new(vec![0.1, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        let far = Embedding::new(vec![10.0, 10.0]);
        let results = EuclideanMatcher.compare_all(&[&b, &far, &a], &g, 0.45);
        let names: Vec<Option<&str>> = results.iter().map(|r| r.identity().map(|i| i.as_str())).collect();
        assert_eq!(names, [Some("Bob"), None, Some("Alice")]);
    }
}
