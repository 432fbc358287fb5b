//! Reusable order sequences shared by the task variants.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::orders::OrderIntent;

use super::tasks::{TaskContext, TaskError};

/// Attempts per requested position before random picking gives up.
const PICK_ATTEMPTS_PER_POSITION: usize = 1000;

/// Rotates to zero and moves to `position` with the gripper open and raised.
pub fn startup(ctx: &TaskContext<'_>, position: [f64; 2]) -> Result<(), TaskError> {
    if let Err(e) = ctx.executor.robot().rotate(0) {
        warn!(error = %e, "Failed to reset rotation");
    }
    thread::sleep(ctx.settle);
    ctx.queue(
        &[
            OrderIntent::gripper_open(),
            OrderIntent::move_z(1.0),
            OrderIntent::move_to(position),
        ],
        ctx.order_delay,
    )?;
    Ok(())
}

/// Raises the arm, moves to the ready pose and closes the gripper.
pub fn go_to_start(ctx: &TaskContext<'_>) -> Result<(), TaskError> {
    ctx.queue(
        &[
            OrderIntent::move_z(1.0),
            OrderIntent::move_to(ctx.start_position),
            OrderIntent::gripper_to(0.0),
        ],
        ctx.order_delay,
    )?;
    Ok(())
}

/// Picks the block at `object` and puts it down at `target`.
///
/// `object_height` is the z the gripper closes at; `target_height` is the z
/// it releases at.
pub fn pickup_and_place(
    ctx: &TaskContext<'_>,
    object: [f64; 2],
    object_height: f64,
    target_height: f64,
    target: [f64; 2],
    delay: Duration,
) -> Result<(), TaskError> {
    debug!(?object, ?target, object_height, target_height, "Pick and place");
    ctx.queue(
        &[
            OrderIntent::move_z(1.0),
            OrderIntent::move_to(object),
            OrderIntent::gripper_open(),
            OrderIntent::move_z(object_height),
            OrderIntent::gripper_close(),
            OrderIntent::move_z(1.0),
            OrderIntent::move_to(target),
            OrderIntent::move_z(target_height),
            OrderIntent::gripper_open(),
        ],
        delay,
    )?;
    Ok(())
}

/// Sweeps the centre of the workspace with the closed gripper, ending raised.
pub fn clear_center(ctx: &TaskContext<'_>) -> Result<(), TaskError> {
    info!("Clearing center");
    let sweep = [
        [0.5, 0.3],
        [0.5, 0.7],
        [0.3, 0.7],
    ];
    let low_sweep = [
        [0.3, 0.5],
        [0.7, 0.5],
        [0.3, 0.3],
        [0.5, 0.5],
        [0.7, 0.7],
        [0.7, 0.5],
        [0.7, 0.3],
        [0.5, 0.5],
        [0.3, 0.7],
    ];

    let mut orders = vec![
        OrderIntent::move_z(1.0),
        OrderIntent::gripper_close(),
        OrderIntent::move_xy(0.3, 0.3),
        OrderIntent::move_z(0.4),
    ];
    orders.extend(sweep.into_iter().map(OrderIntent::move_to));
    orders.push(OrderIntent::move_z(0.1));
    orders.extend(low_sweep.into_iter().map(OrderIntent::move_to));
    orders.push(OrderIntent::move_z(1.0));

    ctx.queue(&orders, ctx.order_delay)?;
    info!("Clearing center complete");
    Ok(())
}

/// Unstacks the tower at `stack_position`, top block first, placing each
/// block at the matching entry of `positions`.
///
/// `heights` are ordered bottom block first.
pub fn reset_blocks(
    ctx: &TaskContext<'_>,
    positions: &[[f64; 2]],
    heights: &[f64],
    stack_position: [f64; 2],
    delay: Duration,
) -> Result<(), TaskError> {
    let reversed: Vec<f64> = heights.iter().rev().copied().collect();
    let mut target_z: f64 = reversed.iter().sum();

    for (index, (position, height)) in positions.iter().zip(&reversed).enumerate() {
        target_z -= height;
        let mut orders = Vec::new();

        if index == 0 {
            orders.extend([
                OrderIntent::move_z(1.0),
                OrderIntent::move_to(stack_position),
                OrderIntent::gripper_open(),
            ]);
        }

        orders.extend([
            OrderIntent::move_z(target_z),
            OrderIntent::gripper_close(),
            OrderIntent::move_z(1.0),
            OrderIntent::move_to(*position),
            OrderIntent::move_z(0.0),
            OrderIntent::gripper_open(),
        ]);

        if index + 1 != reversed.len() {
            orders.extend([
                OrderIntent::move_z(target_z),
                OrderIntent::move_to(stack_position),
            ]);
        }

        ctx.queue(&orders, delay)?;
    }
    Ok(())
}

/// Picks `count` positions from `bank`, each farther than `min_spacing` from
/// every other pick and from every entry of `avoid`.
///
/// # Errors
///
/// Returns `TaskError::NoFreePosition` if no valid set is found.
pub fn pick_random_positions<R: Rng>(
    rng: &mut R,
    bank: &[[f64; 2]],
    count: usize,
    min_spacing: f64,
    avoid: &[[f64; 2]],
) -> Result<Vec<[f64; 2]>, TaskError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if bank.is_empty() {
        return Err(TaskError::NoFreePosition { requested: count });
    }

    let mut picked: Vec<[f64; 2]> = Vec::with_capacity(count);
    for _ in 0..count * PICK_ATTEMPTS_PER_POSITION {
        let candidate = bank[rng.random_range(0..bank.len())];
        let clear = picked
            .iter()
            .chain(avoid)
            .all(|p| distance(candidate, *p) > min_spacing);
        if clear {
            picked.push(candidate);
            if picked.len() == count {
                return Ok(picked);
            }
        }
    }
    Err(TaskError::NoFreePosition { requested: count })
}

/// A random position in `[0.2, 0.8]²` farther than `margin` from the centre.
pub fn random_block_position<R: Rng>(rng: &mut R, margin: f64) -> [f64; 2] {
    loop {
        let candidate = [rng.random_range(0.2..0.8), rng.random_range(0.2..0.8)];
        if distance(candidate, [0.5, 0.5]) > margin {
            return candidate;
        }
    }
}

pub fn distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{OrderExecutor, OrderKind};
    use crate::robot::{RobotCall, SimulatedRobot};
    use crate::vision::ObjectLocator;
    use crate::vision::VisionError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::{Arc, Mutex};

    struct Blind;

    impl ObjectLocator for Blind {
        fn locate(
            &self,
            _frame: &crate::robot::Frame,
            _color: &str,
        ) -> Result<Option<[f64; 2]>, VisionError> {
            Ok(None)
        }
    }

    fn with_ctx<F: FnOnce(&TaskContext<'_>)>(robot: Arc<SimulatedRobot>, f: F) {
        let executor = OrderExecutor::new(robot, Duration::ZERO).with_ramp_step_delay(Duration::ZERO);
        let image = Mutex::new(None);
        let ctx = TaskContext::new(&executor, &Blind, &image)
            .with_start_position([0.0, 0.7])
            .with_order_delay(Duration::ZERO)
            .with_settle(Duration::ZERO);
        f(&ctx);
    }

    #[test]
    fn test_go_to_start_ends_closed_at_ready_pose() {
        let robot = Arc::new(SimulatedRobot::new("sim"));
        with_ctx(robot.clone(), |ctx| go_to_start(ctx).expect("go to start"));

        assert_eq!(
            robot.calls(),
            vec![
                RobotCall::MoveZ { z: 1.0 },
                RobotCall::MoveXy { x: 0.0, y: 0.7 },
                RobotCall::Gripper { angle: 0.0 },
            ]
        );
    }

    #[test]
    fn test_startup_resets_rotation() {
        let robot = Arc::new(SimulatedRobot::new("sim"));
        with_ctx(robot.clone(), |ctx| startup(ctx, [0.5, 0.5]).expect("startup"));

        let calls = robot.calls();
        assert_eq!(calls[0], RobotCall::Rotate { angle: 0 });
        assert_eq!(calls.last(), Some(&RobotCall::MoveXy { x: 0.5, y: 0.5 }));
    }

    #[test]
    fn test_clear_center_ends_raised() {
        let robot = Arc::new(SimulatedRobot::new("sim"));
        with_ctx(robot.clone(), |ctx| clear_center(ctx).expect("clear"));

        assert_eq!(robot.calls().last(), Some(&RobotCall::MoveZ { z: 1.0 }));
        let state = crate::robot::RobotTransport::get_state(robot.as_ref()).expect("state");
        assert_eq!(state.z_norm, 1.0);
    }

    #[test]
    fn test_reset_blocks_unstacks_top_first() {
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let positions = [[0.2, 0.2], [0.8, 0.8]];
        with_ctx(robot.clone(), |ctx| {
            reset_blocks(ctx, &positions, &[0.3, 0.1], [0.5, 0.5], Duration::ZERO).expect("reset")
        });

        let z_moves: Vec<f64> = robot
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                RobotCall::MoveZ { z } => Some(z),
                _ => None,
            })
            .collect();
        // top block (0.1) is gripped at z=0.3, the bottom one at z=0
        assert!((z_moves[1] - 0.3).abs() < 1e-9);
        let bottom_grip = z_moves[z_moves.len() - 3];
        assert!(bottom_grip.abs() < 1e-9);
        assert!(robot
            .calls()
            .contains(&RobotCall::MoveXy { x: 0.8, y: 0.8 }));
    }

    #[test]
    fn test_pick_random_positions_respects_spacing() {
        let mut rng = StdRng::seed_from_u64(3);
        let bank = [[0.2, 0.2], [0.8, 0.2], [0.8, 0.8], [0.2, 0.8], [0.5, 0.5]];

        let picked =
            pick_random_positions(&mut rng, &bank, 3, 0.1, &[[0.5, 0.5]]).expect("positions");

        assert_eq!(picked.len(), 3);
        assert!(!picked.contains(&[0.5, 0.5]));
        for (i, a) in picked.iter().enumerate() {
            for b in &picked[i + 1..] {
                assert!(distance(*a, *b) > 0.1);
            }
        }
    }

    #[test]
    fn test_pick_random_positions_gives_up() {
        let mut rng = StdRng::seed_from_u64(3);
        let err = pick_random_positions(&mut rng, &[[0.2, 0.2]], 2, 0.1, &[])
            .expect_err("only one free slot");
        assert!(matches!(err, TaskError::NoFreePosition { requested: 2 }));
    }

    #[test]
    fn test_random_block_position_avoids_center() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            let p = random_block_position(&mut rng, 0.25);
            assert!(distance(p, [0.5, 0.5]) > 0.25);
            assert!((0.2..0.8).contains(&p[0]) && (0.2..0.8).contains(&p[1]));
        }
    }

    #[test]
    fn test_pickup_and_place_persists_ramp() {
        let temp_dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let robot = Arc::new(SimulatedRobot::new("sim"));
        let executor = OrderExecutor::new(robot, Duration::ZERO).with_ramp_step_delay(Duration::ZERO);
        executor.set_output_dir(Some(temp_dir.path().to_path_buf()));
        let image = Mutex::new(None);
        let ctx = TaskContext::new(&executor, &Blind, &image).with_order_delay(Duration::ZERO);

        pickup_and_place(&ctx, [0.2, 0.3], 0.0, 0.0, [0.5, 0.5], Duration::ZERO).expect("place");

        let orders: Vec<crate::orders::Order> = crate::storage::JsonArrayLog::orders_in(temp_dir.path())
            .read_all()
            .expect("orders");
        // 8 plain orders plus the 6-step closing ramp
        assert_eq!(orders.len(), 14);
        assert_eq!(
            orders.iter().filter(|o| o.kind == OrderKind::GripperClose).count(),
            6
        );
    }
}
