use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use seq_capsnet::model::checkpoint::Checkpoint;
use seq_capsnet::model::config::TrainingConfig;
use seq_capsnet::model::loss::Metrics;
use seq_capsnet::train_data::data_loader::{to_categorical, SequenceDataLoader, PROTEIN_ALPHABET};
use seq_capsnet::{capsnet_main, Result};

#[derive(Parser)]
#[command(name = "seq-capsnet", version, about = "Réseau de capsules pour la classification de séquences")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Entraîne un modèle sur un fichier label<TAB>séquence
    Train {
        /// Jeu d'entraînement
        #[arg(long)]
        data: PathBuf,
        /// Jeu de validation, sinon l'early stopping réserve une partie de l'entraînement
        #[arg(long)]
        validation: Option<PathBuf>,
        /// Configuration d'entraînement (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Alphabet des résidus pour l'encodage one-hot
        #[arg(long, default_value = PROTEIN_ALPHABET)]
        alphabet: String,
        /// Fichier de sortie des poids entraînés
        #[arg(long, short)]
        output: PathBuf,
        /// Fichier de sortie de l'historique par époque (JSON)
        #[arg(long)]
        history: Option<PathBuf>,
    },
    /// Prédit la classe de chaque séquence avec des poids entraînés
    Predict {
        #[arg(long)]
        weights: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long, default_value = PROTEIN_ALPHABET)]
        alphabet: String,
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
    },
    /// Exporte les coefficients de couplage du routing d'un dataset
    Coefficients {
        #[arg(long)]
        weights: PathBuf,
        #[arg(long)]
        data: PathBuf,
        #[arg(long, default_value = PROTEIN_ALPHABET)]
        alphabet: String,
        #[arg(long, default_value_t = 500)]
        batch_size: usize,
        /// Fichier de sortie (JSON, forme N x n_class x n_primary_capsules)
        #[arg(long, short)]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Train {
            data,
            validation,
            config,
            alphabet,
            output,
            history,
        } => cmd_train(data, validation, config, &alphabet, output, history),
        Command::Predict {
            weights,
            data,
            alphabet,
            batch_size,
        } => cmd_predict(weights, data, &alphabet, batch_size),
        Command::Coefficients {
            weights,
            data,
            alphabet,
            batch_size,
            output,
        } => cmd_coefficients(weights, data, &alphabet, batch_size, output),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_train(
    data: PathBuf,
    validation: Option<PathBuf>,
    config: Option<PathBuf>,
    alphabet: &str,
    output: PathBuf,
    history_path: Option<PathBuf>,
) -> Result<()> {
    println!("🚀 CAPSNET SÉQUENCES - ENTRAÎNEMENT");
    println!("=================================\n");

    let config = match config {
        Some(path) => TrainingConfig::load_from_file(path)?,
        None => TrainingConfig::default(),
    };
    println!("⚙️  Type de modèle: {}", config.model_type);
    println!("   Classes: {}, itérations de routing: {}", config.nb_classes, config.routings);
    println!("   lr: {} (décroissance {}/époque), taille de batch: {}", config.lr, config.lrdecay, config.batch_size);

    println!("📁 Chargement des données...");
    let train = SequenceDataLoader::with_alphabet(&data, alphabet).load(config.nb_classes)?;
    let validation = match validation {
        Some(path) => {
            let val = SequenceDataLoader::with_alphabet(&path, alphabet).load(config.nb_classes)?;
            Some((val.x.into_dyn(), val.y))
        }
        None => None,
    };
    println!("   Train: {} échantillons {:?}", train.len(), train.class_counts());
    if let Some((val_x, _)) = &validation {
        println!("   Validation: {} échantillons", val_x.shape()[0]);
    }

    println!("\n🎯 Début de l'entraînement...\n");
    let run = capsnet_main(train.x.into_dyn(), train.y, validation, &config, None)?;
    run.model.save_weights(&output)?;
    println!("\n💾 Poids sauvegardés dans {}", output.display());

    if let Some(history) = &run.history {
        println!("🎉 ENTRAÎNEMENT TERMINÉ après {} époques", history.epochs());
        if let Some(best) = history
            .val_capsnet_loss
            .iter()
            .copied()
            .fold(None, |best: Option<f32>, v| Some(best.map_or(v, |b| b.min(v))))
        {
            println!("   Meilleure val_capsnet_loss: {:.4}", best);
        }
        if let Some(path) = history_path {
            fs::write(&path, serde_json::to_string_pretty(history)?)?;
            println!("   Historique écrit dans {}", path.display());
        }
    }
    Ok(())
}

fn cmd_predict(weights: PathBuf, data: PathBuf, alphabet: &str, batch_size: usize) -> Result<()> {
    let mut model = Checkpoint::load(&weights)?.into_model()?;
    let dataset = SequenceDataLoader::with_alphabet(&data, alphabet).load(model.n_class())?;

    let predicted = model.predict_classes(&dataset.x.view(), batch_size)?;
    println!("label\tpredicted");
    for (label, class) in dataset.labels.iter().zip(&predicted) {
        println!("{}\t{}", label, class);
    }

    let one_hot = to_categorical(&predicted, model.n_class())?;
    let metrics = Metrics::compute(&one_hot.view(), &dataset.y.view());
    metrics.log();
    println!("\n📊 Accuracy: {:.2}%", metrics.accuracy * 100.0);
    Ok(())
}

fn cmd_coefficients(
    weights: PathBuf,
    data: PathBuf,
    alphabet: &str,
    batch_size: usize,
    output: PathBuf,
) -> Result<()> {
    let mut model = Checkpoint::load(&weights)?.into_model()?;
    let dataset = SequenceDataLoader::with_alphabet(&data, alphabet).load(model.n_class())?;

    let coefficients = model.coupling_coefficients(&dataset.x.view(), batch_size)?;
    fs::write(&output, serde_json::to_string(&coefficients)?)?;
    println!(
        "✅ Coefficients de couplage {:?} écrits dans {}",
        coefficients.dim(),
        output.display()
    );
    Ok(())
}
