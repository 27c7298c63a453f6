use eyre::{Result, WrapErr};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader, BufWriter};

pub type Input = Box<dyn AsyncBufRead + Unpin + Send>;
pub type Output = Box<dyn AsyncWrite + Unpin + Send>;

/// Opens `name` for reading; "stdin" reads standard input.
pub async fn open_input(name: &str) -> Result<Input> {
    match name {
        "stdin" => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
        _ => {
            let f = File::open(name)
                .await
                .wrap_err_with(|| format!("opening {}", name))?;
            Ok(Box::new(BufReader::new(f)))
        }
    }
}

/// Creates `name` for writing; "stdout" writes standard output.
pub async fn create_output(name: &str) -> Result<Output> {
    match name {
        "stdout" => Ok(Box::new(BufWriter::new(tokio::io::stdout()))),
        _ => {
            let f = File::create(name)
                .await
                .wrap_err_with(|| format!("creating {}", name))?;
            Ok(Box::new(BufWriter::new(f)))
        }
    }
}
