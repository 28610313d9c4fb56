use ember::uniforms::GatherUniforms;
use ember::Result;

use super::{check_len, decode, usize_of};

/// `y[t, :] = table[ids[t], :]`, zero rows for ids outside the vocabulary.
pub fn gather(table: &[f32], ids: &[u32], y: &mut [f32], uniforms: &[u8]) -> Result<()> {
    let u: GatherUniforms = decode(uniforms)?;
    let (tokens, hidden, vocab) = (
        usize_of(u.num_tokens),
        usize_of(u.hidden_size),
        usize_of(u.vocab_size),
    );
    check_len("table", table.len(), vocab * hidden)?;
    check_len("ids", ids.len(), tokens)?;
    check_len("y", y.len(), tokens * hidden)?;
    for (t, &id) in ids.iter().take(tokens).enumerate() {
        let row = &mut y[t * hidden..(t + 1) * hidden];
        let id = usize_of(id);
        if id < vocab {
            row.copy_from_slice(&table[id * hidden..(id + 1) * hidden]);
        } else {
            row.fill(0.0);
        }
    }
    Ok(())
}
