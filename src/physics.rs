//! Host-side model of the cell integrator.
//!
//! The device kernel in `sim.wgsl` is the production integrator. Everything here
//! describes the contract it runs under: the per-cell wire records, the two-slot
//! state arena, pause/single-step control, and a host implementation of the same
//! step rule used to check the sub-step protocol without a device.

use bytemuck::{Pod, Zeroable};
use cgmath::{InnerSpace, Quaternion, Rotation, Vector3, Zero};

use crate::config::SimConfig;
use crate::voxel_storage::{CellId, Side, VoxelStorage};

/// Rotational inertia of a unit-mass unit cube about its centre.
pub const CUBE_INERTIA: f32 = 1.0 / 6.0;

#[repr(C)]
#[derive(Default, Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct PhysData3D {
    pub pos: [f32; 3],
    pub vel: [f32; 3],
    pub ang_vel: [f32; 3],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct PhysData4D {
    pub turn: [f32; 4],
}

impl Default for PhysData4D {
    fn default() -> Self {
        Self {
            turn: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Uniform block shared by the step kernel.
#[repr(C)]
#[derive(Default, Copy, Clone, Debug, Pod, Zeroable)]
pub struct SimParams {
    pub time_delta: f32,
    pub cell_count: u32,
    pub stiffness: f32,
    pub damping: f32,
    pub angular_damping: f32,
    pub inertia: f32,
    pub _pad: [u32; 2],
}

/// Upload image for both state sets: every cell at its grid position, at rest.
pub fn initial_wire_state(storage: &VoxelStorage) -> (Vec<PhysData3D>, Vec<PhysData4D>) {
    let data_3d = storage
        .cells()
        .iter()
        .map(|cell| PhysData3D {
            pos: cell.position.map(|c| c as f32),
            ..Default::default()
        })
        .collect();
    let data_4d = vec![PhysData4D::default(); storage.cell_count()];
    (data_3d, data_4d)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateSlot {
    A,
    B,
}

impl StateSlot {
    pub fn other(self) -> Self {
        match self {
            StateSlot::A => StateSlot::B,
            StateSlot::B => StateSlot::A,
        }
    }

    pub fn index(self) -> usize {
        match self {
            StateSlot::A => 0,
            StateSlot::B => 1,
        }
    }
}

/// Two state sets and the parity saying which one holds the latest snapshot.
pub struct PingPong<T> {
    sets: [T; 2],
    current: StateSlot,
}

impl<T> PingPong<T> {
    pub fn new(a: T, b: T) -> Self {
        Self {
            sets: [a, b],
            current: StateSlot::A,
        }
    }

    pub fn current_slot(&self) -> StateSlot {
        self.current
    }

    pub fn current(&self) -> &T {
        &self.sets[self.current.index()]
    }

    pub fn next(&self) -> &T {
        &self.sets[self.current.other().index()]
    }

    pub fn current_mut(&mut self) -> &mut T {
        &mut self.sets[self.current.index()]
    }

    /// Read view of the current set and write view of the other.
    pub fn split_mut(&mut self) -> (&T, &mut T) {
        let [a, b] = &mut self.sets;
        match self.current {
            StateSlot::A => (&*a, b),
            StateSlot::B => (&*b, a),
        }
    }

    pub fn swap(&mut self) {
        self.current = self.current.other();
    }
}

#[derive(Clone, Debug)]
pub struct StepControl {
    paused: bool,
    doing_step: bool,
}

impl StepControl {
    pub fn new(start_paused: bool) -> Self {
        Self {
            paused: start_paused,
            doing_step: false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn toggle_pause(&mut self) {
        self.paused = !self.paused;
    }

    pub fn request_single_step(&mut self) {
        self.doing_step = true;
        self.paused = true;
    }

    /// Number of sub-step pairs to issue this frame. Consumes a pending single step.
    pub fn pairs_this_frame(&mut self, config: &SimConfig) -> u32 {
        if self.doing_step {
            self.doing_step = false;
            self.paused = true;
            return 1;
        }
        if self.paused {
            return 0;
        }
        config.pairs_per_frame()
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CellState {
    pub position: Vector3<f32>,
    pub velocity: Vector3<f32>,
    pub angular_velocity: Vector3<f32>,
    pub turn: Quaternion<f32>,
}

impl CellState {
    pub fn at_rest(position: Vector3<f32>) -> Self {
        Self {
            position,
            velocity: Vector3::zero(),
            angular_velocity: Vector3::zero(),
            turn: Quaternion::new(1.0, 0.0, 0.0, 0.0),
        }
    }

    pub fn from_wire(data_3d: &PhysData3D, data_4d: &PhysData4D) -> Self {
        let [x, y, z, w] = data_4d.turn;
        Self {
            position: data_3d.pos.into(),
            velocity: data_3d.vel.into(),
            angular_velocity: data_3d.ang_vel.into(),
            turn: Quaternion::new(w, x, y, z),
        }
    }

    pub fn to_wire(&self) -> (PhysData3D, PhysData4D) {
        let data_3d = PhysData3D {
            pos: self.position.into(),
            vel: self.velocity.into(),
            ang_vel: self.angular_velocity.into(),
        };
        let data_4d = PhysData4D {
            turn: [self.turn.v.x, self.turn.v.y, self.turn.v.z, self.turn.s],
        };
        (data_3d, data_4d)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StepOutput {
    pub state: CellState,
    /// Scratch scalar written alongside the state; visualisation only.
    pub debug: f32,
}

/// Per-cell state transition. Must only depend on the frozen snapshot it is given.
pub trait StepRule {
    fn step(&self, me: &CellState, neighbors: &[Option<CellState>; 6], dt: f32) -> StepOutput;
}

/// Rubber bands between the touching faces of linked cubes.
///
/// Each link pulls the centre of my face towards the centre of the facing neighbor
/// face with a spring, damped on relative velocity. The same force acts at the face
/// centre, which gives the torque. Relative spin is damped per link as well.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RubberBand {
    pub stiffness: f32,
    pub damping: f32,
    pub angular_damping: f32,
    pub inertia: f32,
}

impl Default for RubberBand {
    fn default() -> Self {
        Self {
            stiffness: 200.0,
            damping: 2.0,
            angular_damping: 1.0,
            inertia: CUBE_INERTIA,
        }
    }
}

impl RubberBand {
    pub fn params(&self, time_delta: f32, cell_count: u32) -> SimParams {
        SimParams {
            time_delta,
            cell_count,
            stiffness: self.stiffness,
            damping: self.damping,
            angular_damping: self.angular_damping,
            inertia: self.inertia,
            _pad: [0; 2],
        }
    }
}

pub fn side_direction(side: Side) -> Vector3<f32> {
    let mut dir = Vector3::zero();
    dir[side.axis()] = if side.is_positive() { 1.0 } else { -1.0 };
    dir
}

impl StepRule for RubberBand {
    fn step(&self, me: &CellState, neighbors: &[Option<CellState>; 6], dt: f32) -> StepOutput {
        let mut force = Vector3::zero();
        let mut torque = Vector3::zero();
        let mut stretch_total = 0.0;

        for (side, other) in Side::ALL.iter().zip(neighbors.iter()) {
            let Some(other) = other else { continue };
            let half = side_direction(*side) * 0.5;
            let lever = me.turn.rotate_vector(half);
            let my_anchor = me.position + lever;
            let their_anchor = other.position + other.turn.rotate_vector(-half);
            let stretch = their_anchor - my_anchor;

            let pull = stretch * self.stiffness + (other.velocity - me.velocity) * self.damping;
            force += pull;
            torque += lever.cross(pull);
            torque += (other.angular_velocity - me.angular_velocity) * self.angular_damping;
            stretch_total += stretch.magnitude();
        }

        let velocity = me.velocity + force * dt;
        let angular_velocity = me.angular_velocity + torque * (dt / self.inertia);
        let position = me.position + velocity * dt;
        let spin = Quaternion::from_sv(0.0, angular_velocity);
        let turn = (me.turn + spin * me.turn * (0.5 * dt)).normalize();

        StepOutput {
            state: CellState {
                position,
                velocity,
                angular_velocity,
                turn,
            },
            debug: stretch_total,
        }
    }
}

/// Host implementation of the sub-step protocol over a whole storage.
pub struct CpuSimulation<R: StepRule> {
    links: Vec<[Option<CellId>; 6]>,
    states: PingPong<Vec<CellState>>,
    debug: Vec<f32>,
    rule: R,
    time_delta: f32,
}

impl<R: StepRule> CpuSimulation<R> {
    pub fn new(storage: &VoxelStorage, rule: R, time_delta: f32) -> Self {
        let (data_3d, data_4d) = initial_wire_state(storage);
        let initial: Vec<CellState> = data_3d
            .iter()
            .zip(data_4d.iter())
            .map(|(a, b)| CellState::from_wire(a, b))
            .collect();
        Self {
            links: storage.cells().iter().map(|cell| cell.neighbors).collect(),
            states: PingPong::new(initial.clone(), initial),
            debug: vec![0.0; storage.cell_count()],
            rule,
            time_delta,
        }
    }

    pub fn states(&self) -> &[CellState] {
        self.states.current()
    }

    pub fn states_mut(&mut self) -> &mut [CellState] {
        self.states.current_mut()
    }

    pub fn current_slot(&self) -> StateSlot {
        self.states.current_slot()
    }

    pub fn debug_feedback(&self) -> &[f32] {
        &self.debug
    }

    pub fn sub_step(&mut self) {
        let (input, output) = self.states.split_mut();
        for (i, links) in self.links.iter().enumerate() {
            let neighbors = links.map(|link| link.map(|id| input[id.index()]));
            let result = self.rule.step(&input[i], &neighbors, self.time_delta);
            output[i] = result.state;
            self.debug[i] = result.debug;
        }
        self.states.swap();
    }

    pub fn run_pairs(&mut self, pairs: u32) {
        for _ in 0..pairs {
            self.sub_step();
            self.sub_step();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{gen_sphere, Grid3};

    fn total_momentum(states: &[CellState]) -> Vector3<f32> {
        states.iter().fold(Vector3::zero(), |acc, s| acc + s.velocity)
    }

    #[test]
    fn test_wire_strides() {
        assert_eq!(std::mem::size_of::<PhysData3D>(), 36);
        assert_eq!(std::mem::size_of::<PhysData4D>(), 16);
        assert_eq!(std::mem::size_of::<SimParams>(), 32);
    }

    #[test]
    fn test_ping_pong_parity() {
        let mut pair = PingPong::new("a", "b");
        for steps in 0..9 {
            let expected = if steps % 2 == 0 { StateSlot::A } else { StateSlot::B };
            assert_eq!(pair.current_slot(), expected);
            assert_eq!(*pair.current(), if steps % 2 == 0 { "a" } else { "b" });
            assert_ne!(pair.current(), pair.next());
            pair.swap();
        }
    }

    #[test]
    fn test_step_control() {
        let config = SimConfig::default();
        let mut control = StepControl::new(true);
        assert_eq!(control.pairs_this_frame(&config), 0);

        control.toggle_pause();
        assert_eq!(control.pairs_this_frame(&config), config.pairs_per_frame());

        control.request_single_step();
        assert!(control.is_paused());
        assert_eq!(control.pairs_this_frame(&config), 1);
        assert!(control.is_paused());
        assert_eq!(control.pairs_this_frame(&config), 0);
    }

    #[test]
    fn test_wire_round_trip_keeps_quaternion_order() {
        let state = CellState {
            position: Vector3::new(1.0, 2.0, 3.0),
            velocity: Vector3::new(0.5, 0.0, 0.0),
            angular_velocity: Vector3::new(0.0, 0.0, 2.0),
            turn: Quaternion::new(0.5, 0.5, 0.5, 0.5),
        };
        let (a, b) = state.to_wire();
        assert_eq!(b.turn, [0.5, 0.5, 0.5, 0.5]);
        assert_eq!(CellState::from_wire(&a, &b), state);
        let rest = CellState::from_wire(&PhysData3D::default(), &PhysData4D::default());
        assert_eq!(rest, CellState::at_rest(Vector3::zero()));
    }

    #[test]
    fn test_resting_sphere_stays_put() {
        let storage = VoxelStorage::extract(&gen_sphere(3.0));
        let mut sim = CpuSimulation::new(&storage, RubberBand::default(), 1.0 / 120.0);
        sim.run_pairs(10);
        assert_eq!(sim.current_slot(), StateSlot::A);
        for (state, cell) in sim.states().iter().zip(storage.cells()) {
            let expected = Vector3::new(
                cell.position[0] as f32,
                cell.position[1] as f32,
                cell.position[2] as f32,
            );
            assert!((state.position - expected).magnitude() < 1e-5);
        }
        assert!(sim.debug_feedback().iter().all(|d| d.abs() < 1e-5));
    }

    #[test]
    fn test_odd_sub_step_count_ends_on_second_slot() {
        let storage = VoxelStorage::extract(&Grid3::new([2, 1, 1], true));
        let mut sim = CpuSimulation::new(&storage, RubberBand::default(), 1.0 / 120.0);
        sim.sub_step();
        assert_eq!(sim.current_slot(), StateSlot::B);
        sim.sub_step();
        assert_eq!(sim.current_slot(), StateSlot::A);
    }

    #[test]
    fn test_sub_step_reads_frozen_snapshot() {
        let storage = VoxelStorage::extract(&Grid3::new([2, 1, 1], true));
        let rule = RubberBand::default();
        let dt = 1.0 / 120.0;
        let mut sim = CpuSimulation::new(&storage, rule, dt);
        sim.states_mut()[0].velocity = Vector3::new(-3.0, 0.0, 1.0);
        let before: Vec<CellState> = sim.states().to_vec();

        sim.sub_step();

        let mut expect_1 = [None; 6];
        expect_1[Side::NegX.index()] = Some(before[0]);
        let expected = rule.step(&before[1], &expect_1, dt);
        assert_eq!(sim.states()[1], expected.state);
        assert_eq!(sim.debug_feedback()[1], expected.debug);
    }

    #[test]
    fn test_links_conserve_momentum() {
        let storage = VoxelStorage::extract(&gen_sphere(2.0));
        let mut sim = CpuSimulation::new(&storage, RubberBand::default(), 1.0 / 120.0);
        sim.states_mut()[0].velocity = Vector3::new(4.0, -1.0, 2.0);
        sim.states_mut()[3].angular_velocity = Vector3::new(0.0, 5.0, 0.0);
        let start = total_momentum(sim.states());

        sim.run_pairs(20);

        let end = total_momentum(sim.states());
        assert!((end - start).magnitude() < 1e-3, "momentum drifted from {:?} to {:?}", start, end);
        assert!(sim.debug_feedback().iter().any(|d| *d > 0.0));
        for state in sim.states() {
            assert!((state.turn.magnitude() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_inertia_reaches_the_kernel_uniform() {
        let rule = RubberBand::default();
        let params = rule.params(1.0 / 120.0, 7);
        assert_eq!(params.inertia, CUBE_INERTIA);
        assert_eq!(params.cell_count, 7);

        let heavy = RubberBand {
            inertia: CUBE_INERTIA * 2.0,
            ..rule
        };
        assert_eq!(heavy.params(1.0 / 120.0, 7).inertia, CUBE_INERTIA * 2.0);

        let storage = VoxelStorage::extract(&Grid3::new([2, 1, 1], true));
        let spin_after_one_step = |rule: RubberBand| {
            let mut sim = CpuSimulation::new(&storage, rule, 1.0 / 120.0);
            sim.states_mut()[1].position.y += 0.5;
            sim.sub_step();
            sim.states()[0].angular_velocity.z
        };
        let light_spin = spin_after_one_step(rule);
        let heavy_spin = spin_after_one_step(heavy);
        assert!(light_spin.abs() > 1e-3);
        assert!((light_spin - 2.0 * heavy_spin).abs() < 1e-4 * light_spin.abs());
    }

    #[test]
    fn test_stretched_pair_pulls_together() {
        let storage = VoxelStorage::extract(&Grid3::new([2, 1, 1], true));
        let mut sim = CpuSimulation::new(&storage, RubberBand::default(), 1.0 / 120.0);
        sim.states_mut()[1].position.x += 0.5;
        sim.sub_step();
        assert!(sim.states()[0].velocity.x > 0.0);
        assert!(sim.states()[1].velocity.x < 0.0);
    }
}
