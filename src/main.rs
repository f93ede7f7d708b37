use anyhow::Result;
use caption_transformer::{CaptionModel, ModelConfig};
use tch::{nn, Device, IndexOp, Kind, Tensor};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let config = match args.get(1) {
        Some(path) => ModelConfig::from_json_file(path)?,
        None => ModelConfig::default(),
    };

    let varstore = nn::VarStore::new(Device::cuda_if_available());
    let model = CaptionModel::new(&varstore.root(), &config)?;

    let features = Tensor::randn(
        &[2, config.dim, config.image_height, config.image_width],
        (Kind::Float, varstore.device()),
    );
    let tokens = model.generate(&features, config.max_length).to_device(Device::Cpu);

    for row in 0..tokens.size()[0] {
        let ids = Vec::<i64>::try_from(&tokens.i(row))?;
        log::info!("sample {row}: {} tokens {:?}", ids.len(), ids);
    }
    Ok(())
}
