use anyhow::{anyhow, Result};
use clap::{arg, Command};
use nrl_model::{
    dataset::DEFAULT_PREFIX, Adam, Dataset, EpochReport, ErrorRegressionConfig, ModelConfig,
    Network, OnlineSession, Trainer,
};
use nrl_utils::{jsonify, read_rows, write_json, write_rows};
use serde::Serialize;
use std::path::PathBuf;

const STATE_FILE: &str = "e_state.d";

fn cli() -> Command {
    Command::new("nrl-runtime")
        .about("Trains PV-RNN models and runs online error regression")
        .arg_required_else_help(true)
        .subcommand(
            Command::new("train")
                .about("Trains a model on the primitives under datapath")
                .arg(
                    arg!(<CONFIG> "Path to a properties file or a json configuration")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(--epochs [EPOCHS] "Overrides the configured number of epochs")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--output [OUTPUT_FILE] "If set, the training summary is saved to this json file")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("postdict")
                .about("Predicts then postdicts a trajectory one frame at a time")
                .arg(
                    arg!(<CONFIG> "Path to a properties file or a json configuration")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(<FRAMES> "Path to the observed joint values, one frame per row")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--primitive [PRIMITIVE] "Training primitive used for burn-in")
                        .default_value("0")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--window [WINDOW] "Postdiction window length")
                        .default_value("10")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--epochs [EPOCHS] "Optimisation iterations per observed frame")
                        .default_value("50")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--alpha [ALPHA] "Adam learning rate of the window offsets")
                        .default_value("0.1")
                        .value_parser(clap::value_parser!(f32)),
                )
                .arg(
                    arg!(--store [STORE_DIR] "If set, generated and inferred states are saved to this directory")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--output [OUTPUT_FILE] "If set, predictions and losses are saved to this json file")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("predict")
                .about("Rolls the prior forward from a saved state")
                .arg(
                    arg!(<CONFIG> "Path to a properties file or a json configuration")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(--state [STATE_FILE] "State written by postdict. Defaults to the zero state")
                        .value_parser(clap::value_parser!(PathBuf)),
                )
                .arg(
                    arg!(--steps [STEPS] "Number of frames to predict")
                        .default_value("100")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--output [OUTPUT_FILE] "If set, the predicted frames are saved to this json file")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let matches = cli().get_matches();

    if let Err(e) = match matches.subcommand() {
        Some(("train", sub_m)) => train(
            sub_m.get_one::<String>("CONFIG").unwrap().clone(),
            sub_m.get_one::<usize>("epochs").cloned(),
            sub_m.get_one::<PathBuf>("output").cloned(),
        ),
        Some(("postdict", sub_m)) => postdict(
            sub_m.get_one::<String>("CONFIG").unwrap().clone(),
            sub_m.get_one::<PathBuf>("FRAMES").unwrap().clone(),
            *sub_m.get_one::<usize>("primitive").unwrap(),
            *sub_m.get_one::<usize>("window").unwrap(),
            *sub_m.get_one::<usize>("epochs").unwrap(),
            *sub_m.get_one::<f32>("alpha").unwrap(),
            sub_m.get_one::<PathBuf>("store").cloned(),
            sub_m.get_one::<PathBuf>("output").cloned(),
        ),
        Some(("predict", sub_m)) => predict(
            sub_m.get_one::<String>("CONFIG").unwrap().clone(),
            sub_m.get_one::<PathBuf>("state").cloned(),
            *sub_m.get_one::<usize>("steps").unwrap(),
            sub_m.get_one::<PathBuf>("output").cloned(),
        ),
        _ => Err(anyhow!("Invalid subcommand")),
    } {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

#[derive(Serialize)]
struct TrainSummary {
    epochs: usize,
    best_loss: f32,
    last: Option<EpochReport>,
}

#[derive(Serialize)]
struct PostdictSummary {
    predictions: Vec<Vec<f32>>,
    losses: Vec<f32>,
    state: Vec<f32>,
}

#[derive(Serialize)]
struct PredictSummary {
    frames: Vec<Vec<f32>>,
}

pub fn train(config: String, epochs: Option<usize>, output_file: Option<PathBuf>) -> Result<()> {
    let mut config = ModelConfig::load(&config)?;
    if let Some(epochs) = epochs {
        config.epochs = epochs;
    }
    let (data, mut net) = setup(&config)?;
    let mut trainer = Trainer::new(
        config.training_config(),
        Some(config.modelpath.clone()),
        config.seed,
    );
    let reports = trainer.train(&mut net, &data.encoded())?;
    emit(
        &TrainSummary {
            epochs: trainer.step(),
            best_loss: trainer.best_loss(),
            last: reports.last().cloned(),
        },
        output_file,
    )
}

pub fn postdict(
    config: String,
    frames_path: PathBuf,
    primitive: usize,
    window: usize,
    epochs: usize,
    alpha: f32,
    store_dir: Option<PathBuf>,
    output_file: Option<PathBuf>,
) -> Result<()> {
    let config = ModelConfig::load(&config)?;
    let (data, mut net) = setup(&config)?;
    net.load(&config.modelpath)?;
    let frames = data.encode_softmax(&read_rows(&frames_path)?)?;

    let mut session = OnlineSession::start(
        &mut net,
        ErrorRegressionConfig {
            primitive,
            window,
            epochs,
            w: config.w.clone(),
            adam: Adam::new(alpha, config.beta1, config.beta2),
            num_times: frames.len(),
            store_gen: store_dir.is_some(),
            store_inference: store_dir.is_some(),
        },
    )?;
    let mut predictions = Vec::with_capacity(frames.len());
    let mut losses = Vec::new();
    for frame in frames {
        let predicted = session.predict(&mut net)?;
        predictions.push(data.decode_frame(&predicted));
        if let Some(report) = session.observe(&mut net, frame)? {
            losses.push(report.best.loss);
        }
    }

    let state = net.e_state()?;
    if let Some(dir) = &store_dir {
        net.e_save(dir)?;
        write_rows(dir.join(STATE_FILE), &state, state.len())?;
    }
    emit(
        &PostdictSummary {
            predictions,
            losses,
            state,
        },
        output_file,
    )
}

pub fn predict(
    config: String,
    state_path: Option<PathBuf>,
    steps: usize,
    output_file: Option<PathBuf>,
) -> Result<()> {
    let config = ModelConfig::load(&config)?;
    let (data, mut net) = setup(&config)?;
    net.load(&config.modelpath)?;
    let state: Vec<f32> = match state_path {
        Some(path) => read_rows(&path)?.into_iter().flatten().collect(),
        None => vec![0.0; net.state_dim()],
    };
    net.a_init(&state)?;
    let frames = net
        .a_predict(steps)
        .iter()
        .map(|frame| data.decode_frame(frame))
        .collect();
    emit(&PredictSummary { frames }, output_file)
}

fn setup(config: &ModelConfig) -> Result<(Dataset, Network)> {
    let mut data = config.dataset()?;
    data.load_dir(&config.datapath, DEFAULT_PREFIX, config.nsamples)?;
    let net = Network::new(config.network_config()?, data.shape())?;
    Ok((data, net))
}

fn emit<T: Serialize>(obj: &T, output_file: Option<PathBuf>) -> Result<()> {
    match output_file {
        Some(path) => write_json(&path, obj),
        None => {
            println!("{}", jsonify(obj)?);
            Ok(())
        }
    }
}
