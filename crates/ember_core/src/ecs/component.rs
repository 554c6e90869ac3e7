// component.rs - compile-time component enumeration and payload types
//
// Components are identified by kind index, not by Rust type: the same
// payload type may back several kinds (Position and Velocity are both
// Vec3). The size table below is the single layout input the column
// store consumes.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use std::mem::size_of;

/// Number of declared component kinds.
pub const NUM_COMPONENT_KINDS: usize = 8;

/// The closed set of component kinds an entity may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ComponentKind {
    Position = 0,
    Velocity = 1,
    Rotation = 2,
    Behavior = 3,
    Gravity = 4,
    Scale = 5,
    Active = 6,
    DestroyTimer = 7,
}

impl ComponentKind {
    /// Every kind, in kind-index order.
    pub const ALL: [ComponentKind; NUM_COMPONENT_KINDS] = [
        ComponentKind::Position,
        ComponentKind::Velocity,
        ComponentKind::Rotation,
        ComponentKind::Behavior,
        ComponentKind::Gravity,
        ComponentKind::Scale,
        ComponentKind::Active,
        ComponentKind::DestroyTimer,
    ];

    pub fn from_index(index: usize) -> ComponentKind {
        Self::ALL[index]
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn bit(self) -> u32 {
        1 << self as u32
    }

    /// Payload size in bytes.
    #[inline]
    pub fn size(self) -> usize {
        COMPONENT_SIZES[self.index()]
    }
}

/// Byte size of each component kind, ordered by kind index.
///
/// The column store treats this as read-only layout input.
pub const COMPONENT_SIZES: [usize; NUM_COMPONENT_KINDS] = [
    size_of::<Vec3>(),          // Position
    size_of::<Vec3>(),          // Velocity
    size_of::<Rot3>(),          // Rotation
    size_of::<BehaviorState>(), // Behavior
    size_of::<GravityParams>(), // Gravity
    size_of::<f32>(),           // Scale
    size_of::<ActiveState>(),   // Active
    size_of::<u16>(),           // DestroyTimer
];

/// Largest entry of [`COMPONENT_SIZES`]; sizes the swap-delete scratch.
pub(crate) const fn max_component_size() -> usize {
    let mut max = 0;
    let mut index = 0;
    while index < NUM_COMPONENT_KINDS {
        if COMPONENT_SIZES[index] > max {
            max = COMPONENT_SIZES[index];
        }
        index += 1;
    }
    max
}

/// Fixed-point Euler rotation: one signed 16-bit angle unit per axis,
/// 65536 units per full turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Rot3 {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Rot3 {
    pub const fn new(x: i16, y: i16, z: i16) -> Self {
        Self { x, y, z }
    }
}

/// Gravity integration parameters consumed by the physics step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct GravityParams {
    pub accel: f32,
    pub terminal_velocity: f32,
}

/// Activation flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct ActiveState(u8);

impl ActiveState {
    const DEACTIVATED: u8 = 1 << 0;
    const DELETE_ON_DEACTIVATE: u8 = 1 << 1;

    pub fn deactivated(self) -> bool {
        self.0 & Self::DEACTIVATED != 0
    }

    pub fn set_deactivated(&mut self, on: bool) {
        if on {
            self.0 |= Self::DEACTIVATED;
        } else {
            self.0 &= !Self::DEACTIVATED;
        }
    }

    pub fn delete_on_deactivate(self) -> bool {
        self.0 & Self::DELETE_ON_DEACTIVATE != 0
    }

    pub fn set_delete_on_deactivate(&mut self, on: bool) {
        if on {
            self.0 |= Self::DELETE_ON_DEACTIVATE;
        } else {
            self.0 &= !Self::DELETE_ON_DEACTIVATE;
        }
    }
}

/// Inline parameter capacity of a behavior instance, in bytes.
pub const BEHAVIOR_DATA_SIZE: usize = 16;

/// The closed set of entity behaviors, dispatched by `World::run_behaviors`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum BehaviorKind {
    Idle = 0,
    Spin = 1,
    Pulse = 2,
    SelfDestruct = 3,
}

impl BehaviorKind {
    pub fn raw(self) -> u16 {
        self as u16
    }

    /// Unknown ids decode as `Idle` so a stale payload can never dispatch
    /// out of the closed set.
    pub fn from_raw(raw: u16) -> BehaviorKind {
        match raw {
            1 => BehaviorKind::Spin,
            2 => BehaviorKind::Pulse,
            3 => BehaviorKind::SelfDestruct,
            _ => BehaviorKind::Idle,
        }
    }
}

/// Per-entity behavior: a behavior id plus a fixed inline parameter
/// payload. Never allocates; each [`BehaviorKind`] defines its own packing
/// of `data`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BehaviorState {
    pub kind: u16,
    pub data: [u8; BEHAVIOR_DATA_SIZE],
}

impl BehaviorState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn spin(rate: Rot3) -> Self {
        Self::with_params(BehaviorKind::Spin, SpinParams { rate })
    }

    pub fn pulse(base: f32, amplitude: f32, period: u16) -> Self {
        Self::with_params(
            BehaviorKind::Pulse,
            PulseParams {
                base,
                amplitude,
                period,
                phase: 0,
            },
        )
    }

    pub fn self_destruct(ticks: u16) -> Self {
        Self::with_params(BehaviorKind::SelfDestruct, SelfDestructParams { ticks })
    }

    fn with_params<P: Pod>(kind: BehaviorKind, params: P) -> Self {
        let mut state = Self {
            kind: kind.raw(),
            data: [0; BEHAVIOR_DATA_SIZE],
        };
        state.set_params(params);
        state
    }

    /// Decode the payload as `P`.
    pub fn params<P: Pod>(&self) -> P {
        bytemuck::pod_read_unaligned(&self.data[..size_of::<P>()])
    }

    /// Re-encode the payload from `P`.
    pub fn set_params<P: Pod>(&mut self, params: P) {
        let bytes = bytemuck::bytes_of(&params);
        debug_assert!(bytes.len() <= BEHAVIOR_DATA_SIZE, "behavior payload too large");
        self.data[..bytes.len()].copy_from_slice(bytes);
    }
}

/// Payload of [`BehaviorKind::Spin`].
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SpinParams {
    /// Angle units added per tick, per axis.
    pub rate: Rot3,
}

/// Payload of [`BehaviorKind::Pulse`]: a triangle-wave scale oscillation.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct PulseParams {
    pub base: f32,
    pub amplitude: f32,
    pub period: u16,
    pub phase: u16,
}

/// Payload of [`BehaviorKind::SelfDestruct`].
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SelfDestructParams {
    /// Ticks until the entity queues its own deletion.
    pub ticks: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_table_matches_kinds() {
        for kind in ComponentKind::ALL {
            assert_eq!(kind.size(), COMPONENT_SIZES[kind.index()]);
        }
        assert_eq!(ComponentKind::Position.size(), 12);
        assert_eq!(ComponentKind::Behavior.size(), 2 + BEHAVIOR_DATA_SIZE);
        assert_eq!(max_component_size(), 2 + BEHAVIOR_DATA_SIZE);
    }

    #[test]
    fn test_active_state_flags() {
        let mut state = ActiveState::default();
        assert!(!state.deactivated());

        state.set_deactivated(true);
        state.set_delete_on_deactivate(true);
        assert!(state.deactivated());
        assert!(state.delete_on_deactivate());

        state.set_deactivated(false);
        assert!(!state.deactivated());
        assert!(state.delete_on_deactivate());
    }

    #[test]
    fn test_behavior_params_roundtrip() {
        let state = BehaviorState::pulse(1.0, 0.25, 60);
        assert_eq!(BehaviorKind::from_raw(state.kind), BehaviorKind::Pulse);

        let params: PulseParams = state.params();
        assert_eq!(params.base, 1.0);
        assert_eq!(params.amplitude, 0.25);
        assert_eq!(params.period, 60);
        assert_eq!(params.phase, 0);
    }

    #[test]
    fn test_unknown_behavior_id_is_idle() {
        assert_eq!(BehaviorKind::from_raw(999), BehaviorKind::Idle);
    }
}
