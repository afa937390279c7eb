//! Pin scope policy.
//!
//! A pure function of the pin kind, the acting device class and the owner's
//! registered device roster. Nothing is cached; the scope is recomputed on
//! every pin action.

use std::collections::BTreeSet;

use tidefeed_shared::types::{DeviceClass, PinKind};

/// The primary device class: the first registered one, else the acting one.
pub fn primary_class(acting: DeviceClass, roster: &[DeviceClass]) -> DeviceClass {
    roster
        .iter()
        .copied()
        .find(|c| *c != DeviceClass::Unknown)
        .unwrap_or(acting)
}

/// Device classes that must hold a pin.
///
/// * `standard` -> `{primary}`
/// * `amplified` -> `{primary}` plus every other registered class
pub fn decide_scope(
    kind: PinKind,
    acting: DeviceClass,
    roster: &[DeviceClass],
) -> BTreeSet<DeviceClass> {
    let primary = primary_class(acting, roster);
    let mut scope = BTreeSet::from([primary]);

    if kind == PinKind::Amplified {
        let secondary = roster
            .iter()
            .copied()
            .filter(|c| *c != DeviceClass::Unknown && *c != primary);
        scope.extend(secondary);
    }

    scope
}
