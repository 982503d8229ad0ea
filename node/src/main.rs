#[cfg(feature = "esp32")]
mod esp;
#[cfg(not(feature = "esp32"))]
mod host;
mod portal;

#[cfg(not(feature = "esp32"))]
fn main() -> anyhow::Result<()> {
    host::run()
}

#[cfg(feature = "esp32")]
fn main() -> anyhow::Result<()> {
    esp::run()
}
