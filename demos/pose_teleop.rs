// Keyboard teleop: WASD move in x/y, R/F up/down, B toggle elbow, E enable, Space stop, P disable, Q quit
//
// Each key press sends a short straight-line move of the tool tip to the runtime.
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use servo_arm_runtime::arm::{Flip, Pose};
use servo_arm_runtime::config::TOPIC_CMD;
use servo_arm_runtime::messages::ArmCommand;
use std::time::Duration;
use tracing::info;

const STEP_CM: f64 = 1.0; // tool travel per key press
const MOVE_TIME: f64 = 0.3; // seconds per jog

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD).await?;

    info!("Controls: WASD=x/y, R/F=z, B=elbow, E=enable, Space=stop, P=disable, Q=quit");

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn send(
    publisher: &zenoh::pubsub::Publisher<'_>,
    cmd: &ArmCommand,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    publisher.put(serde_json::to_string(cmd)?).await?;
    Ok(())
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Commanded target; starts at the home pose
    let mut target = Pose::new(0.0, 25.0, 9.1)
        .with_flip(Flip::A)
        .with_time(MOVE_TIME);

    loop {
        if !event::poll(Duration::from_millis(20))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press && kind != KeyEventKind::Repeat {
            continue;
        }

        let jog = match code {
            KeyCode::Char('w') => (0.0, STEP_CM, 0.0),
            KeyCode::Char('s') => (0.0, -STEP_CM, 0.0),
            KeyCode::Char('a') => (-STEP_CM, 0.0, 0.0),
            KeyCode::Char('d') => (STEP_CM, 0.0, 0.0),
            KeyCode::Char('r') => (0.0, 0.0, STEP_CM),
            KeyCode::Char('f') => (0.0, 0.0, -STEP_CM),

            KeyCode::Char('b') => {
                target.flip = if target.flip == Flip::B { Flip::A } else { Flip::B };
                info!("Elbow branch: {:?}", target.flip);
                (0.0, 0.0, 0.0)
            }
            KeyCode::Char('e') => {
                send(publisher, &ArmCommand::Enable).await?;
                continue;
            }
            KeyCode::Char(' ') => {
                send(publisher, &ArmCommand::Stop).await?;
                continue;
            }
            KeyCode::Char('p') => {
                send(publisher, &ArmCommand::Disable).await?;
                continue;
            }

            // Quit
            KeyCode::Char('q') | KeyCode::Esc => break,

            _ => continue,
        };

        target.x += jog.0;
        target.y += jog.1;
        target.z += jog.2;
        info!("Target: x={:.1} y={:.1} z={:.1}", target.x, target.y, target.z);
        send(
            publisher,
            &ArmCommand::Line {
                pose: target.clone(),
            },
        )
        .await?;
    }

    Ok(())
}
