//! Local HTML summary rendered when emission runs in manual-summary mode.

use crate::payload::EmissionPayload;

/// Render a self-contained HTML page describing the invoice.
pub fn render_summary_html(payload: &EmissionPayload) -> String {
    let a = &payload.amounts;
    let mut rows = String::new();
    for line in payload.lines() {
        rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
            escape(&line.description),
            line.quantity,
            line.unit_price,
            line.line_total
        ));
    }

    format!(
        r#"<!DOCTYPE html>
<html lang="pt-BR">
<head><meta charset="utf-8"><title>Nota Fiscal {number}</title></head>
<body>
<h1>Nota Fiscal {number}</h1>
<p>Emitida em {issued} | OS #{order}</p>
<p>Cliente: {client}{document}</p>
<table>
<thead><tr><th>Descrição</th><th>Qtd</th><th>Unitário</th><th>Total</th></tr></thead>
<tbody>
{rows}</tbody>
</table>
<table>
<tr><td>Produtos</td><td>{products}</td></tr>
<tr><td>Serviços</td><td>{services}</td></tr>
<tr><td>Base de cálculo</td><td>{base}</td></tr>
<tr><td>ICMS</td><td>{icms}</td></tr>
<tr><td>ISS</td><td>{iss}</td></tr>
<tr><td>PIS</td><td>{pis}</td></tr>
<tr><td>COFINS</td><td>{cofins}</td></tr>
<tr><td>Total de impostos</td><td>{taxes}</td></tr>
<tr><td><strong>Total</strong></td><td><strong>{total}</strong></td></tr>
</table>
</body>
</html>
"#,
        number = payload.invoice_number,
        issued = payload.issued_at.format("%d/%m/%Y %H:%M"),
        order = payload.order_id,
        client = escape(&payload.client.name),
        document = payload
            .client
            .document
            .as_deref()
            .map(|d| format!(" ({})", escape(d)))
            .unwrap_or_default(),
        rows = rows,
        products = a.products,
        services = a.services,
        base = a.base,
        icms = a.icms,
        iss = a.iss,
        pis = a.pis,
        cofins = a.cofins,
        taxes = a.total_taxes,
        total = a.total,
    )
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
