use ndarray::{Array2, Array3, ArrayD};
use tracing::{info, warn};

use super::data_loader::{normalize_input_rank, split_tail};
use crate::error::{CapsError, Result};
use crate::model::builder::ModelBuilder;
use crate::model::config::{NetworkConfig, TrainingConfig};
use crate::model::core::{CapsNet, History};
use crate::model::optimizer::build_optimizer;

/// Un modèle et l'historique de son entraînement, s'il a été entraîné.
pub struct TrainingRun {
    pub model: CapsNet,
    pub history: Option<History>,
}

fn check_labels(x: &Array3<f32>, y: &Array2<f32>, nb_classes: usize, context: &str) -> Result<()> {
    if y.dim() != (x.dim().0, nb_classes) {
        return Err(CapsError::shape(
            format!("{} labels", context),
            &[x.dim().0, nb_classes],
            y.shape(),
        ));
    }
    Ok(())
}

/// Construit (ou réutilise) un réseau de capsules et l'entraîne.
///
/// Avec `existing`, ses poids sont gardés tels quels et `config.weights`
/// est ignoré. Avec `config.predict`, le modèle est renvoyé sans entraînement
/// et `config.weights` n'est pas chargé. Avec l'early stopping et sans
/// données de validation, la dernière fraction `validation_split` des lignes
/// d'entraînement est réservée.
pub fn capsnet_main(
    train_x: ArrayD<f32>,
    train_y: Array2<f32>,
    validation: Option<(ArrayD<f32>, Array2<f32>)>,
    config: &TrainingConfig,
    existing: Option<CapsNet>,
) -> Result<TrainingRun> {
    config.validate()?;
    let mut train_x = normalize_input_rank(train_x)?;
    let mut train_y = train_y;
    check_labels(&train_x, &train_y, config.nb_classes, "training")?;
    let mut validation = match validation {
        Some((val_x, val_y)) => {
            let val_x = normalize_input_rank(val_x)?;
            check_labels(&val_x, &val_y, config.nb_classes, "validation")?;
            Some((val_x, val_y))
        }
        None => None,
    };

    let (_, length, channels) = train_x.dim();
    let input_shape = (length, channels);

    let (mut model, built_fresh) = match existing {
        Some(model) => {
            if model.network_config.input_shape != input_shape
                || model.n_class() != config.nb_classes
            {
                return Err(CapsError::Config(format!(
                    "existing model expects input {:?} with {} classes, got {:?} with {}",
                    model.network_config.input_shape,
                    model.n_class(),
                    input_shape,
                    config.nb_classes
                )));
            }
            info!("reusing existing model");
            (model, false)
        }
        None => {
            let mut network = NetworkConfig::preset(
                config.model_type,
                input_shape,
                config.nb_classes,
                config.routings,
            );
            network.seed = config.seed;
            (ModelBuilder::new().with_network_config(network).build()?, true)
        }
    };

    if config.predict {
        return Ok(TrainingRun {
            model,
            history: None,
        });
    }

    if let (true, Some(weights)) = (built_fresh, &config.weights) {
        model.load_weights(weights)?;
        info!(path = %weights.display(), "weights loaded");
    }

    if config.earlystop.is_some() && validation.is_none() {
        let ((head_x, head_y), (tail_x, tail_y)) =
            split_tail(&train_x, &train_y, config.validation_split)?;
        if tail_x.dim().0 == 0 {
            warn!(
                validation_split = config.validation_split,
                samples = train_x.dim().0,
                "no rows held out for early stopping, training for nb_epoch"
            );
        } else {
            info!(
                train = head_x.dim().0,
                validation = tail_x.dim().0,
                "held out validation rows"
            );
            train_x = head_x;
            train_y = head_y;
            validation = Some((tail_x, tail_y));
        }
    }

    let mut optimizer = build_optimizer(config.optimizer, config.lr);
    let history = {
        let val_views = validation.as_ref().map(|(vx, vy)| (vx.view(), vy.view()));
        model.fit(
            &train_x.view(),
            &train_y.view(),
            val_views.as_ref().map(|(vx, vy)| (vx, vy)),
            config,
            optimizer.as_mut(),
        )?
    };

    Ok(TrainingRun {
        model,
        history: Some(history),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::ModelType;
    use ndarray::IxDyn;

    fn toy_data(n: usize) -> (ArrayD<f32>, Array2<f32>) {
        // (N, 1, L, C) avec L assez long pour les noyaux prédéfinis (1 + 8 + 19)
        let x = ArrayD::from_shape_fn(IxDyn(&[n, 1, 28, 3]), |idx| {
            if (idx[0] + idx[2]) % 3 == idx[3] {
                1.0
            } else {
                0.0
            }
        });
        let y = Array2::from_shape_fn((n, 2), |(b, k)| if b % 2 == k { 1.0 } else { 0.0 });
        (x, y)
    }

    #[test]
    fn predict_returns_untrained_model() {
        let (x, y) = toy_data(4);
        let config = TrainingConfig {
            predict: true,
            routings: 1,
            ..TrainingConfig::default()
        };
        let run = capsnet_main(x, y, None, &config, None).unwrap();
        assert!(run.history.is_none());
        assert_eq!(run.model.network_config.input_shape, (28, 3));
    }

    #[test]
    fn predict_skips_weight_loading() {
        let (x, y) = toy_data(4);
        let config = TrainingConfig {
            predict: true,
            routings: 1,
            weights: Some(std::env::temp_dir().join("seq_capsnet_missing_weights.json")),
            ..TrainingConfig::default()
        };
        let run = capsnet_main(x.clone(), y.clone(), None, &config, None).unwrap();
        assert!(run.history.is_none());

        let config = TrainingConfig {
            predict: false,
            ..config
        };
        assert!(matches!(
            capsnet_main(x, y, None, &config, None),
            Err(CapsError::Io(_))
        ));
    }

    #[test]
    fn rejects_mislabelled_input() {
        let (x, _) = toy_data(4);
        let y = Array2::zeros((3, 2));
        let result = capsnet_main(x, y, None, &TrainingConfig::default(), None);
        assert!(matches!(result, Err(CapsError::Shape { .. })));
    }

    #[test]
    fn rejects_existing_model_with_other_shape() {
        let (x, y) = toy_data(4);
        let existing = ModelBuilder::new()
            .with_network_config(NetworkConfig::preset(
                ModelType::NoGradientStop,
                (40, 3),
                2,
                1,
            ))
            .build()
            .unwrap();
        let result = capsnet_main(x, y, None, &TrainingConfig::default(), Some(existing));
        assert!(matches!(result, Err(CapsError::Config(_))));
    }
}
