mod commands;

use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use clap::Parser;

use commands::Command;
use hero::{MessageKind, Session, SessionConfig};

const TICK: Duration = Duration::from_millis(16);

#[derive(Parser)]
#[command(name = "hero-node")]
#[command(about = "Hosts or joins a HERO session and chats over it")]
struct Args {
    #[arg(help = "`host` to host a session, otherwise the address of the host to join")]
    mode: String,

    #[arg(short, long, default_value_t = hero::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long)]
    name: Option<String>,

    #[arg(long, default_value_t = 10, help = "Seconds of silence before a peer is dropped")]
    peer_timeout_secs: u64,

    #[arg(long, default_value_t = 2)]
    ping_interval_secs: u64,
}

impl Args {
    fn hosting(&self) -> bool {
        self.mode.eq_ignore_ascii_case("host")
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            peer_timeout: Duration::from_secs(self.peer_timeout_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            ..Default::default()
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let name = match &args.name {
        Some(name) => name.clone(),
        None if args.hosting() => "host".to_string(),
        None => "player".to_string(),
    };

    let mut session = Session::new(args.session_config());
    install_callbacks(&mut session);

    if args.hosting() {
        if !session.host_game(args.port, &name) {
            bail!("could not host on port {}", args.port);
        }
    } else if !session.join_game(&args.mode, args.port, &name) {
        bail!("could not join {}:{}", args.mode, args.port);
    }

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || read_commands(tx));

    // the session lives on the update thread only
    let update = thread::spawn(move || run_session(session, rx));
    update
        .join()
        .map_err(|_| anyhow!("update thread panicked"))?;

    Ok(())
}

fn install_callbacks(session: &mut Session) {
    session.set_message_callback(|msg, from| {
        match MessageKind::from_tag(&msg.tag) {
            Some(MessageKind::Chat) => {
                let sender = msg.arg(0).unwrap_or("?");
                println!("[{}] {}", sender, msg.arg(1).unwrap_or_default());
            }
            _ => log::info!("{} {:?} from {}", msg.tag, msg.args, from),
        }
    });
    session.set_player_joined_callback(|id, name| {
        println!("* {} joined as player {}", name, id);
    });
    session.set_player_left_callback(|id| {
        println!("* player {} left", id);
    });
}

fn read_commands(tx: Sender<Command>) {
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else {
            break;
        };
        let Some(command) = Command::parse(&line) else {
            continue;
        };
        let quit = command == Command::Quit;
        if tx.send(command).is_err() || quit {
            break;
        }
    }
}

fn run_session(mut session: Session, commands: Receiver<Command>) {
    let mut accepting = true;
    let mut last = Instant::now();

    'outer: loop {
        while accepting {
            match commands.try_recv() {
                Ok(Command::Quit) => break 'outer,
                Ok(command) => apply(&mut session, command),
                Err(TryRecvError::Empty) => break,
                // stdin closed, keep serving
                Err(TryRecvError::Disconnected) => accepting = false,
            }
        }

        let now = Instant::now();
        session.update((now - last).as_secs_f32());
        last = now;

        if !session.is_connected() {
            log::warn!("session ended");
            break;
        }
        thread::sleep(TICK);
    }

    session.disconnect();
}

fn apply(session: &mut Session, command: Command) {
    match command {
        Command::Chat(text) => {
            session.send_chat_message(&text);
        }
        Command::Start(map) => {
            session.send_game_start(&map);
        }
        Command::Players => {
            for record in session.clients().values() {
                let marker = if Some(record.player_id) == session.local_player_id() {
                    " (you)"
                } else {
                    ""
                };
                println!(
                    "  {:>3} {}{}",
                    record.player_id, record.display_name, marker
                );
            }
        }
        Command::Ping => {
            if let Some(rtt) = session.rtt() {
                println!("last rtt {:.1} ms", rtt.as_secs_f32() * 1000.0);
            }
            session.request_ping();
        }
        Command::Stats => {
            println!(
                "messages sent {} received {}",
                session.packets_sent(),
                session.packets_received()
            );
            if let Some(stats) = session.stats() {
                println!(
                    "datagrams sent {} received {} dropped {}",
                    stats.packets_sent, stats.packets_received, stats.packets_dropped
                );
            }
        }
        Command::Unknown(name) => log::warn!("unknown command /{}", name),
        Command::Quit => {}
    }
}
