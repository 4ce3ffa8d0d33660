//! Queue family selection checked against every small family layout.

use ember_gpu::queue::{
    queue_family_score, select_exclusive_queue_families, select_queue_families,
};
use ember_gpu::{QueueCapabilities, QueueCapability, QueueFamily, QueueFamilyContainer};

/// Every container of up to three families drawn from all capability sets.
fn layouts() -> impl Iterator<Item = Vec<QueueFamily>> {
    let sets: Vec<QueueCapabilities> = (0..16u8)
        .map(QueueCapabilities::from_bits_truncate)
        .collect();

    let mut layouts = Vec::new();
    for &a in &sets {
        layouts.push(vec![a]);
        for &b in &sets {
            layouts.push(vec![a, b]);
            for &c in &sets {
                layouts.push(vec![a, b, c]);
            }
        }
    }

    layouts.into_iter().map(|caps| {
        (0u32..)
            .zip(caps)
            .map(|(index, caps)| QueueFamily::new(index, 1, caps, 64))
            .collect()
    })
}

#[test]
fn selection_succeeds_exactly_when_all_capabilities_are_present() {
    for families in layouts() {
        let container: QueueFamilyContainer = families.into_iter().collect();
        let selected = select_queue_families(&container);
        assert_eq!(
            selected.is_ok(),
            container.has_all_capabilities(),
            "{container:?}"
        );
    }
}

#[test]
fn selected_family_has_the_highest_score_and_wins_ties_by_order() {
    for families in layouts() {
        let container: QueueFamilyContainer = families.into_iter().collect();
        let Ok(selected) = select_queue_families(&container) else {
            continue;
        };

        for capability in QueueCapability::ALL {
            let chosen = selected.get(capability);
            assert!(chosen.has(capability), "{capability:?} in {container:?}");

            let chosen_score = queue_family_score(chosen, capability);
            for family in container.iter() {
                let score = queue_family_score(family, capability);
                if family.index() < chosen.index() {
                    assert!(score < chosen_score, "{capability:?} in {container:?}");
                } else {
                    assert!(score <= chosen_score, "{capability:?} in {container:?}");
                }
            }
        }
    }
}

#[test]
fn exclusive_selection_prefers_dedicated_families() {
    for families in layouts() {
        let container: QueueFamilyContainer = families.into_iter().collect();
        let Ok(shared) = select_queue_families(&container) else {
            continue;
        };
        let exclusive = select_exclusive_queue_families(&container, &shared);

        for capability in QueueCapability::ALL {
            let dedicated = container
                .families_with(capability)
                .find(|family| family.is_exclusive());
            match dedicated {
                Some(family) => assert_eq!(exclusive.get(capability), family),
                None => assert_eq!(exclusive.get(capability), shared.get(capability)),
            }
        }
    }
}

#[test]
fn empty_families_are_never_selected() {
    let container: QueueFamilyContainer = [
        QueueFamily::new(0, 0, QueueCapabilities::all(), 64),
        QueueFamily::new(1, 4, QueueCapabilities::all(), 64),
    ]
    .into_iter()
    .collect();

    let selected = select_queue_families(&container).unwrap();
    for capability in QueueCapability::ALL {
        assert_eq!(selected.get(capability).index(), 1);
    }
}
