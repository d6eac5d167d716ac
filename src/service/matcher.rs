//! Face Matcher
//!
//! Nearest-neighbor identity lookup over a gallery of stored descriptors.
//! The gallery is only changed through `&mut self`, so lookups never race a
//! reload.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{ContextPolicy, MatchingConfig};
use crate::storage::StoredDescriptor;
use crate::utils::math::euclidean_distance;

/// Photo context selecting the match threshold and face cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchContext {
    Portrait,
    Action,
    Podium,
    Auto,
}

impl MatchContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchContext::Portrait => "portrait",
            MatchContext::Action => "action",
            MatchContext::Podium => "podium",
            MatchContext::Auto => "auto",
        }
    }
}

impl fmt::Display for MatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "portrait" => Ok(MatchContext::Portrait),
            "action" => Ok(MatchContext::Action),
            "podium" => Ok(MatchContext::Podium),
            "auto" => Ok(MatchContext::Auto),
            other => Err(format!("unknown match context: {}", other)),
        }
    }
}

/// An accepted identity match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub identity_id: String,
    pub identity_name: String,
    pub team: Option<String>,
    pub role: Option<String>,
    pub distance: f32,
    /// `1 - distance`; not a calibrated probability
    pub confidence: f32,
}

/// Face Matcher
pub struct FaceMatcher {
    dimension: usize,
    policies: MatchingConfig,
    gallery: Vec<StoredDescriptor>,
}

impl FaceMatcher {
    /// Create an empty matcher for descriptors of `config.descriptor_dimension`
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            dimension: config.descriptor_dimension,
            policies: config.clone(),
            gallery: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn policy(&self, context: MatchContext) -> ContextPolicy {
        match context {
            MatchContext::Portrait => self.policies.portrait,
            MatchContext::Action => self.policies.action,
            MatchContext::Podium => self.policies.podium,
            MatchContext::Auto => self.policies.auto,
        }
    }

    /// Replace the gallery. Vectors of the wrong dimension are skipped, and
    /// identities left without vectors are dropped. Returns the identity count.
    pub fn load(&mut self, descriptors: Vec<StoredDescriptor>) -> usize {
        self.gallery.clear();
        for descriptor in descriptors {
            self.add(descriptor);
        }
        info!(
            "Gallery loaded: {} identities, {} descriptors",
            self.identity_count(),
            self.descriptor_count()
        );
        self.identity_count()
    }

    /// Add one identity, filtering its vectors like `load`
    pub fn add(&mut self, mut descriptor: StoredDescriptor) -> bool {
        let before = descriptor.embeddings.len();
        let dimension = self.dimension;
        descriptor.embeddings.retain(|e| e.len() == dimension);

        let skipped = before - descriptor.embeddings.len();
        if skipped > 0 {
            warn!(
                "Skipped {} descriptors for {} with wrong dimension (expected {})",
                skipped, descriptor.identity_id, dimension
            );
        }
        if descriptor.embeddings.is_empty() {
            return false;
        }

        self.gallery.push(descriptor);
        true
    }

    pub fn clear(&mut self) {
        self.gallery.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.gallery.len()
    }

    pub fn descriptor_count(&self) -> usize {
        self.gallery.iter().map(|d| d.embeddings.len()).sum()
    }

    /// Closest identity over every stored vector, accepted only below the
    /// context threshold
    pub fn find_match(&self, query: &[f32], context: MatchContext) -> Option<MatchResult> {
        if self.gallery.is_empty() {
            return None;
        }
        if query.len() != self.dimension {
            debug!("Query has {} dims, gallery uses {}", query.len(), self.dimension);
            return None;
        }

        let (best, distance) = self
            .gallery
            .iter()
            .flat_map(|d| {
                d.embeddings
                    .iter()
                    .filter_map(move |e| euclidean_distance(query, e).map(|dist| (d, dist)))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))?;

        let threshold = self.policy(context).threshold;
        if distance >= threshold {
            debug!(
                "Closest identity {} at {:.3} is above the {} threshold {:.3}",
                best.identity_id, distance, context, threshold
            );
            return None;
        }

        Some(MatchResult {
            identity_id: best.identity_id.clone(),
            identity_name: best.identity_name.clone(),
            team: best.team.clone(),
            role: best.role.clone(),
            distance,
            confidence: 1.0 - distance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dim: usize) -> MatchingConfig {
        MatchingConfig {
            descriptor_dimension: dim,
            ..MatchingConfig::default()
        }
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_exact_match() {
        let mut matcher = FaceMatcher::new(&config(4));
        matcher.load(vec![
            StoredDescriptor::new("a", "Alice", vec![unit(4, 0)]),
            StoredDescriptor::new("b", "Bob", vec![unit(4, 1)]),
        ]);

        let m = matcher.find_match(&unit(4, 1), MatchContext::Auto).unwrap();
        assert_eq!(m.identity_id, "b");
        assert_eq!(m.distance, 0.0);
        assert_eq!(m.confidence, 1.0);
    }

    #[test]
    fn test_empty_gallery_never_matches() {
        let matcher = FaceMatcher::new(&config(4));
        for ctx in [MatchContext::Portrait, MatchContext::Action, MatchContext::Podium, MatchContext::Auto] {
            assert!(matcher.find_match(&unit(4, 0), ctx).is_none());
        }
    }

    #[test]
    fn test_min_over_all_descriptors() {
        let mut matcher = FaceMatcher::new(&config(2));
        matcher.load(vec![
            // Alice's mean would sit far from the query; her second vector is closest
            StoredDescriptor::new("a", "Alice", vec![vec![-1.0, 0.0], vec![0.1, 0.9]]),
            StoredDescriptor::new("b", "Bob", vec![vec![0.5, 0.5]]),
        ]);
        let m = matcher.find_match(&[0.0, 1.0], MatchContext::Action).unwrap();
        assert_eq!(m.identity_id, "a");
        assert!((m.confidence - (1.0 - m.distance)).abs() < 1e-6);
    }

    #[test]
    fn test_context_threshold() {
        let mut matcher = FaceMatcher::new(&config(2));
        matcher.load(vec![StoredDescriptor::new("a", "Alice", vec![vec![1.0, 0.0]])]);
        // distance sqrt(0.85) ~ 0.922: above portrait 0.9, below action 1.0
        let query = [0.3, 0.7];
        let d = euclidean_distance(&query, &[1.0, 0.0]).unwrap();
        assert!(d > 0.9 && d < 1.0);
        assert!(matcher.find_match(&query, MatchContext::Portrait).is_none());
        assert!(matcher.find_match(&query, MatchContext::Action).is_some());
    }

    #[test]
    fn test_wrong_dimensions() {
        let mut matcher = FaceMatcher::new(&config(3));
        let loaded = matcher.load(vec![
            StoredDescriptor::new("a", "Alice", vec![vec![1.0, 0.0, 0.0], vec![1.0; 128]]),
            StoredDescriptor::new("b", "Bob", vec![vec![1.0; 128]]),
        ]);
        assert_eq!(loaded, 1);
        assert_eq!(matcher.descriptor_count(), 1);
        assert!(matcher.find_match(&[1.0, 0.0], MatchContext::Auto).is_none());
    }

    #[test]
    fn test_clear_and_reload() {
        let mut matcher = FaceMatcher::new(&config(2));
        matcher.load(vec![StoredDescriptor::new("a", "Alice", vec![vec![1.0, 0.0]])]);
        matcher.clear();
        assert!(matcher.is_empty());
        assert!(matcher.add(StoredDescriptor::new("b", "Bob", vec![vec![0.0, 1.0]])));
        assert_eq!(matcher.find_match(&[0.0, 1.0], MatchContext::Auto).unwrap().identity_name, "Bob");
    }

    #[test]
    fn test_context_parsing() {
        assert_eq!("Podium".parse::<MatchContext>().unwrap(), MatchContext::Podium);
        assert!("sideways".parse::<MatchContext>().is_err());
        let policy = FaceMatcher::new(&MatchingConfig::default()).policy(MatchContext::Portrait);
        assert_eq!(policy.max_faces, 3);
    }
}
