//! Legal analysis seed
//!
//! A fixed eight-section template injected into the system context when
//! routing flags a legal document or legal filename. Triggered purely by
//! routing flags; no content inspection happens here.

/// The eight mandated sections, in order.
pub const LEGAL_SECTIONS: [&str; 8] = [
    "Document Type & Parties",
    "Key Obligations",
    "Rights & Entitlements",
    "Term & Termination",
    "Liability & Indemnification",
    "Dispute Resolution & Governing Law",
    "Red Flags & Unusual Clauses",
    "Plain-Language Summary",
];

/// Render the analysis skeleton appended to the system context.
pub fn render_template() -> String {
    let mut out = String::from(
        "Structure any legal analysis under exactly these eight numbered sections:\n",
    );
    for (i, section) in LEGAL_SECTIONS.iter().enumerate() {
        out.push_str(&format!("{}. {section}\n", i + 1));
    }
    out.push_str(
        "Quote clause numbers where available. Flag anything you cannot determine \
         from the document as UNSTATED rather than guessing.\n",
    );
    out
}
