//! Skip / resume / restart decision for one (source, destination) pair.
//!
//! The decision is a pure function of sizes, fingerprints and the destination's append
//! capability; fetching those inputs and acting on the result is up to the orchestrator.

/// What the orchestrator should do with a file pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Destination already matches; stream nothing.
    Skip,
    /// Destination is larger than the source: delete it, then copy from byte 0.
    Restart,
    /// Stream from `offset`, truncating the destination first when `truncate` is set.
    Copy { offset: u64, truncate: bool },
}

/// Observed state of one side of the pair.
#[derive(Clone, Debug, Default)]
pub struct State<'a> {
    pub exists: bool,
    pub size: i64,
    pub md5: Option<&'a str>,
}

/// Fingerprints are only worth computing when a skip is possible.
pub fn needs_fingerprints(source: &State, destination: &State) -> bool {
    destination.exists && source.size == destination.size
}

pub fn decide(source: &State, destination: &State, append: bool) -> Action {
    if !destination.exists {
        return Action::Copy {
            offset: 0,
            truncate: true,
        };
    }
    if source.md5.is_some() && source.md5 == destination.md5 && source.size == destination.size {
        return Action::Skip;
    }
    if destination.size > source.size {
        return Action::Restart;
    }
    if append && source.size > destination.size && destination.size > 0 {
        return Action::Copy {
            offset: u64::try_from(destination.size).unwrap_or(0),
            truncate: false,
        };
    }
    Action::Copy {
        offset: 0,
        truncate: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state(size: i64, md5: Option<&str>) -> State<'_> {
        State {
            exists: true,
            size,
            md5,
        }
    }

    #[test]
    fn missing_destination_copies_from_zero() {
        let action = decide(&state(5000, None), &State::default(), true);
        assert_eq!(
            action,
            Action::Copy {
                offset: 0,
                truncate: true
            }
        );
    }

    #[test]
    fn matching_fingerprints_skip() {
        assert_eq!(
            decide(&state(10, Some("abc")), &state(10, Some("abc")), true),
            Action::Skip
        );
    }

    #[test]
    fn matching_samples_with_different_sizes_do_not_skip() {
        let eight_mb = 8 * 1024 * 1024;
        let twenty_mb = 20 * 1024 * 1024;
        assert_eq!(
            decide(&state(twenty_mb, Some("abc")), &state(eight_mb, Some("abc")), true),
            Action::Copy {
                offset: eight_mb as u64,
                truncate: false
            }
        );
    }

    #[test]
    fn partial_destination_resumes() {
        assert_eq!(
            decide(&state(100, None), &state(40, None), true),
            Action::Copy {
                offset: 40,
                truncate: false
            }
        );
    }

    #[test]
    fn whole_object_destinations_never_resume() {
        assert_eq!(
            decide(&state(100, None), &state(40, None), false),
            Action::Copy {
                offset: 0,
                truncate: true
            }
        );
    }

    #[test]
    fn larger_destination_restarts() {
        assert_eq!(
            decide(&state(10, Some("a")), &state(20, Some("b")), true),
            Action::Restart
        );
    }

    #[test]
    fn same_size_different_content_rewrites() {
        assert_eq!(
            decide(&state(10, Some("a")), &state(10, Some("b")), true),
            Action::Copy {
                offset: 0,
                truncate: true
            }
        );
    }

    #[test]
    fn empty_destination_rewrites() {
        assert_eq!(
            decide(&state(10, None), &state(0, None), true),
            Action::Copy {
                offset: 0,
                truncate: true
            }
        );
    }

    #[test]
    fn fingerprints_only_for_equal_sizes() {
        assert!(needs_fingerprints(&state(10, None), &state(10, None)));
        assert!(!needs_fingerprints(&state(10, None), &state(5, None)));
        assert!(!needs_fingerprints(&state(0, None), &State::default()));
    }

    proptest! {
        #[test]
        fn absent_destination_always_fresh(size in 0i64..i64::MAX, append in any::<bool>()) {
            prop_assert_eq!(
                decide(&state(size, None), &State::default(), append),
                Action::Copy { offset: 0, truncate: true }
            );
        }

        #[test]
        fn resume_offset_never_exceeds_source(src in 0i64..1_000_000, dst in 0i64..1_000_000) {
            match decide(&state(src, None), &state(dst, None), true) {
                Action::Copy { offset, truncate } => {
                    prop_assert!(offset as i64 <= src);
                    prop_assert_eq!(truncate, offset == 0);
                }
                Action::Restart => prop_assert!(dst > src),
                Action::Skip => prop_assert!(false, "skip without fingerprints"),
            }
        }
    }
}
