use thiserror::Error;

/// Errors surfaced by the OCR pipeline (classification, decision,
/// rendering, grafting, optimization, assembly). Every fatal variant maps
/// to a stable exit code (see [`SandwichError::exit_code`]).
#[derive(Error, Debug)]
pub enum SandwichError {
    #[error("invalid arguments: {0}")]
    BadArguments(String),

    #[error("input is not a PDF file: {0}")]
    InputNotPdf(String),

    #[error("required external tool not available: {0}")]
    MissingDependency(String),

    #[error("input PDF is encrypted")]
    Encrypted,

    #[error("input PDF carries a digital signature that processing would invalidate")]
    Signed,

    #[error("page {0} already has a text layer; pass --redo-ocr or --force-ocr to override")]
    AlreadyHasText(usize),

    #[error("OCR timed out on page {0} after {1:?}")]
    OcrTimeout(usize, std::time::Duration),

    #[error("external collaborator failed: {0}")]
    ChildProcessError(String),

    #[error("assembled output failed structural self-check: {0}")]
    InvalidOutputPdf(String),

    #[error("PDF/A conversion failed, regular PDF retained: {0}")]
    PdfaConversionFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("file access error: {0}")]
    FileAccess(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Pdf(#[from] PdfError),

    #[error("{0}")]
    Other(String),
}

impl SandwichError {
    /// The process exit code this error corresponds to, per the stable
    /// CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            SandwichError::BadArguments(_) => 1,
            SandwichError::InputNotPdf(_) => 2,
            SandwichError::MissingDependency(_) => 3,
            SandwichError::InvalidOutputPdf(_) => 4,
            SandwichError::FileAccess(_) => 5,
            SandwichError::AlreadyHasText(_) => 6,
            SandwichError::ChildProcessError(_) => 7,
            SandwichError::Encrypted | SandwichError::Signed => 8,
            SandwichError::InvalidConfig(_) => 9,
            SandwichError::PdfaConversionFailed(_) => 10,
            SandwichError::Cancelled => 130,
            SandwichError::OcrTimeout(..) => 0,
            SandwichError::Pdf(_) | SandwichError::Other(_) => 15,
        }
    }

    /// Whether the output file should be kept when this error terminates
    /// the run; the partial result is still useful for these two.
    pub fn retains_output(&self) -> bool {
        matches!(
            self,
            SandwichError::InvalidOutputPdf(_) | SandwichError::PdfaConversionFailed(_)
        )
    }
}

pub type SandwichResult<T> = std::result::Result<T, SandwichError>;

/// Errors of the vendored PDF object-model substrate.
#[derive(Error, Debug)]
pub enum PdfError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid PDF structure: {0}")]
    InvalidStructure(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Invalid page number: {0}")]
    InvalidPageNumber(u32),
}

pub type Result<T> = std::result::Result<T, PdfError>;
