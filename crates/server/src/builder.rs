//! Document rendering
//!
//! Documents are rendered to HTML with Tera, then converted to PDF with wkhtmltopdf. The Word
//! export is the same HTML wrapped with Office namespaces and served as `application/msword`,
//! which Word and LibreOffice open as an editable document.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tera::{Context, Tera};
use tokio::process::Command;
use tracing::{error, info, warn};
use vocario_core::conversation::render::{format_money, format_percent};
use vocario_core::{ApplicationError, DocumentFormat, DocumentRecord};

const TEMPLATE_NAME: &str = "document.html.tera";
const ACCENT_COLOR: &str = "#1d4ed8";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("template error: {0}")]
    Template(String),
    #[error("conversion error: {0}")]
    Conversion(String),
    #[error("wkhtmltopdf not found")]
    WkhtmltopdfNotFound,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BuildError> for ApplicationError {
    fn from(error: BuildError) -> Self {
        match error {
            BuildError::Template(message) => Self::Configuration(message),
            BuildError::WkhtmltopdfNotFound | BuildError::Conversion(_) => {
                Self::Integration(error.to_string())
            }
            BuildError::Io(error) => Self::Persistence(error.to_string()),
        }
    }
}

#[async_trait]
pub trait DocumentBuilder: Send + Sync {
    async fn build(
        &self,
        document: &DocumentRecord,
        format: DocumentFormat,
    ) -> Result<Vec<u8>, BuildError>;
}

#[derive(Clone, Debug)]
pub struct TeraDocumentBuilder {
    tera: Tera,
    company_name: String,
    wkhtmltopdf_path: Option<PathBuf>,
}

impl TeraDocumentBuilder {
    /// Loads `*.html.tera` templates from `template_dir`.
    pub fn from_dir(template_dir: &Path, company_name: &str) -> Result<Self, BuildError> {
        let pattern = format!("{}/**/*.html.tera", template_dir.display());
        let mut tera = Tera::new(&pattern).map_err(|e| BuildError::Template(e.to_string()))?;
        tera.autoescape_on(vec![".html.tera"]);
        Ok(Self { tera, company_name: company_name.to_owned(), wkhtmltopdf_path: None })
    }

    /// Uses the template compiled into the binary.
    pub fn embedded(company_name: &str) -> Result<Self, BuildError> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![".html.tera"]);
        tera.add_raw_template(
            TEMPLATE_NAME,
            include_str!("../../../templates/documents/document.html.tera"),
        )
        .map_err(|e| BuildError::Template(e.to_string()))?;
        Ok(Self { tera, company_name: company_name.to_owned(), wkhtmltopdf_path: None })
    }

    /// Uses `configured` when given, otherwise looks wkhtmltopdf up on `PATH`.
    pub fn with_wkhtmltopdf(mut self, configured: Option<PathBuf>) -> Self {
        self.wkhtmltopdf_path = configured.or_else(|| which::which("wkhtmltopdf").ok());
        match &self.wkhtmltopdf_path {
            Some(path) => info!(path = %path.display(), "wkhtmltopdf found"),
            None => warn!("wkhtmltopdf not found in PATH - PDF builds will fail"),
        }
        self
    }

    pub fn render_html(
        &self,
        document: &DocumentRecord,
        format: DocumentFormat,
    ) -> Result<String, BuildError> {
        let mut context = Context::new();
        context.insert("document", &DocumentView::new(document, &self.company_name));
        context.insert("word", &(format == DocumentFormat::Word));
        context.insert("accent_color", ACCENT_COLOR);
        self.tera.render(TEMPLATE_NAME, &context).map_err(|e| BuildError::Template(e.to_string()))
    }

    async fn convert_html_to_pdf(
        &self,
        html: &str,
        wkhtmltopdf_path: &Path,
    ) -> Result<Vec<u8>, BuildError> {
        let temp_dir = std::env::temp_dir();
        let stem = uuid::Uuid::new_v4();
        let html_path = temp_dir.join(format!("document_{stem}.html"));
        let pdf_path = temp_dir.join(format!("document_{stem}.pdf"));

        tokio::fs::write(&html_path, html).await?;

        let output = Command::new(wkhtmltopdf_path)
            .args(["--page-size", "A4", "--encoding", "utf-8", "--quiet"])
            .args(["--margin-top", "10mm", "--margin-bottom", "10mm"])
            .args(["--margin-left", "10mm", "--margin-right", "10mm"])
            .arg(&html_path)
            .arg(&pdf_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        let _ = tokio::fs::remove_file(&html_path).await;
        let output = output?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "wkhtmltopdf failed");
            let _ = tokio::fs::remove_file(&pdf_path).await;
            return Err(BuildError::Conversion(stderr.to_string()));
        }

        let pdf_bytes = tokio::fs::read(&pdf_path).await?;
        let _ = tokio::fs::remove_file(&pdf_path).await;

        info!(size = pdf_bytes.len(), "PDF generated successfully");
        Ok(pdf_bytes)
    }
}

#[async_trait]
impl DocumentBuilder for TeraDocumentBuilder {
    async fn build(
        &self,
        document: &DocumentRecord,
        format: DocumentFormat,
    ) -> Result<Vec<u8>, BuildError> {
        let html = self.render_html(document, format)?;
        match format {
            DocumentFormat::Word => Ok(html.into_bytes()),
            DocumentFormat::Pdf => {
                let path =
                    self.wkhtmltopdf_path.as_deref().ok_or(BuildError::WkhtmltopdfNotFound)?;
                self.convert_html_to_pdf(&html, path).await
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct DocumentView {
    title: &'static str,
    number: String,
    issued_on: String,
    is_quote: bool,
    company_name: String,
    source_quote: Option<String>,
    client_name: String,
    client_phone: Option<String>,
    client_email: Option<String>,
    client_address: Option<String>,
    project: Option<String>,
    completion_delay: Option<String>,
    lines: Vec<LineView>,
    subtotal: String,
    discount_pct: Option<String>,
    discount: String,
    net: String,
    vat_rate: String,
    vat: String,
    total: String,
    deposit_pct: Option<String>,
    deposit: Option<String>,
    deductions: Vec<DeductionView>,
    amount_due: Option<String>,
}

#[derive(Debug, Serialize)]
struct LineView {
    description: String,
    quantity: String,
    unit: &'static str,
    unit_price: String,
    amount: String,
}

#[derive(Debug, Serialize)]
struct DeductionView {
    label: String,
    amount: String,
}

impl DocumentView {
    fn new(document: &DocumentRecord, company_name: &str) -> Self {
        let totals = document.totals();
        let lines = document
            .lines
            .iter()
            .map(|line| LineView {
                description: line.description.clone(),
                quantity: line.quantity.normalize().to_string().replace('.', ","),
                unit: line.unit.label(),
                unit_price: format_money(line.unit_price),
                amount: format_money(line.amount()),
            })
            .collect();
        let deductions: Vec<DeductionView> = document
            .deductions
            .iter()
            .map(|deduction| DeductionView {
                label: deduction.label.clone(),
                amount: format_money(deduction.amount),
            })
            .collect();

        Self {
            title: document.title(),
            number: document.number.clone(),
            issued_on: document.issued_on.format("%d/%m/%Y").to_string(),
            is_quote: document.is_quote(),
            company_name: company_name.to_owned(),
            source_quote: document.source_quote.as_ref().map(ToString::to_string),
            client_name: document.client.display_name().to_owned(),
            client_phone: document.client.phone.clone(),
            client_email: document.client.email.clone(),
            client_address: document.client.address.clone(),
            project: document.project.clone(),
            completion_delay: document.completion_delay.clone(),
            lines,
            subtotal: format_money(totals.subtotal),
            discount_pct: (!document.discount_pct.is_zero())
                .then(|| format_percent(document.discount_pct)),
            discount: format_money(totals.discount),
            net: format_money(totals.net),
            vat_rate: format_percent(totals.vat_rate),
            vat: format_money(totals.vat),
            total: format_money(totals.total),
            deposit_pct: document.deposit_pct.map(format_percent),
            deposit: totals.deposit.map(format_money),
            amount_due: (!deductions.is_empty()).then(|| format_money(document.amount_due())),
            deductions,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use vocario_core::domain::document::{Deduction, DocumentRecord, InvoiceKind};
    use vocario_core::domain::draft::{DraftDocument, LineItem, Unit};
    use vocario_core::{DocumentFormat, DocumentId, DocumentKind};

    use super::{BuildError, DocumentBuilder, TeraDocumentBuilder};

    fn quote() -> DocumentRecord {
        let mut draft = DraftDocument::new(DocumentKind::Quote);
        draft.client.name = Some("Dupont <script>".to_owned());
        draft.project = Some("Rénovation salle de bain".to_owned());
        draft.lines = vec![
            LineItem {
                description: "Carrelage".to_owned(),
                quantity: Decimal::new(125, 1),
                unit: Unit::SquareMetre,
                unit_price: Decimal::new(45, 0),
            },
            LineItem::flat("Dépose", Decimal::new(350, 0)),
        ];
        draft.discount_pct = Decimal::new(5, 0);
        DocumentRecord::from_draft(
            DocumentId("33600000000-1".to_owned()),
            "DEV-20260115-0001".to_owned(),
            &draft,
            Decimal::new(20, 0),
            NaiveDate::from_ymd_opt(2026, 1, 15).expect("valid date"),
        )
    }

    #[test]
    fn html_carries_lines_totals_and_escaped_client() {
        let builder = TeraDocumentBuilder::embedded("Carrelage Martin").expect("templates");
        let html = builder.render_html(&quote(), DocumentFormat::Pdf).expect("render");

        assert!(html.contains("DEV-20260115-0001"));
        assert!(html.contains("Carrelage Martin"));
        assert!(html.contains("12,5"));
        assert!(html.contains("562,50 €"));
        assert!(html.contains("Remise (5 %)"));
        assert!(html.contains("15/01/2026"));
        assert!(html.contains("Dupont &lt;script&gt;"));
        assert!(!html.contains("urn:schemas-microsoft-com:office:word"));
    }

    #[test]
    fn final_invoices_show_deductions_and_amount_due() {
        let mut invoice = quote();
        invoice.kind = DocumentKind::Invoice;
        invoice.invoice_kind = Some(InvoiceKind::Final);
        invoice.deductions =
            vec![Deduction { label: "Acompte FAC-1".to_owned(), amount: Decimal::new(300, 0) }];
        let builder = TeraDocumentBuilder::embedded("Carrelage Martin").expect("templates");

        let html = builder.render_html(&invoice, DocumentFormat::Pdf).expect("render");

        assert!(html.contains("Facture finale"));
        assert!(html.contains("Acompte FAC-1"));
        assert!(html.contains("Reste à payer"));
    }

    #[tokio::test]
    async fn word_export_is_office_flavoured_html() {
        let builder = TeraDocumentBuilder::embedded("Carrelage Martin").expect("templates");
        let bytes = builder.build(&quote(), DocumentFormat::Word).await.expect("build");
        let html = String::from_utf8(bytes).expect("utf-8");

        assert!(html.contains("urn:schemas-microsoft-com:office:word"));
        assert!(html.contains("Rénovation salle de bain"));
    }

    #[tokio::test]
    async fn pdf_without_converter_is_an_error() {
        let builder = TeraDocumentBuilder::embedded("Carrelage Martin").expect("templates");
        let result = builder.build(&quote(), DocumentFormat::Pdf).await;

        assert!(matches!(result, Err(BuildError::WkhtmltopdfNotFound)));
    }
}
